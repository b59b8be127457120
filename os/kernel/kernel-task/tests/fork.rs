use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_task::{
    CalleeSavedRegisters, ForkError, KernelThreadFrame, ResumePoints, SavedFrame, Scheduler,
    Task, TaskConstructor, TaskFlags, TaskState, UserForkFrame,
};
use kernel_vmem::testing::{TestMachine, TestPhys};
use kernel_vmem::{AddressSpace, LocalShootdown, PageEntryBits, PhysMapper, TlbShootdown};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

const RESUME: ResumePoints = ResumePoints {
    kernel_thread: VirtualAddress::new(0xffff_ffff_8000_1000),
    user_fork: VirtualAddress::new(0xffff_ffff_8000_2000),
};

const USER_VA: VirtualAddress = VirtualAddress::new(0x40_0000);
const ENTRY: VirtualAddress = VirtualAddress::new(0x40_0010);

const REGS: CalleeSavedRegisters = CalleeSavedRegisters {
    rbx: 1,
    rbp: 2,
    r12: 3,
    r13: 4,
    r14: 5,
    r15: 6,
    rsp: 0x7fff_f000,
};

#[derive(Default)]
struct RecordingScheduler<'m>(Mutex<Vec<Arc<Task<'m, TestPhys>>>>);

impl<'m> Scheduler<'m, TestPhys> for RecordingScheduler<'m> {
    fn schedule_runnable(&self, task: Arc<Task<'m, TestPhys>>) {
        self.0.lock().unwrap().push(task);
    }
}

/// Counts broadcast flushes.
#[derive(Default)]
struct CountingShootdown(AtomicUsize);

impl TlbShootdown for CountingShootdown {
    fn invalidate_page(&self, _va: VirtualAddress) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

impl RecordingScheduler<'_> {
    fn drain(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// A running user task with one writable page at `USER_VA`.
fn user_parent(m: &TestMachine) -> (AddressSpace<'_, TestPhys>, Task<'_, TestPhys>, FrameNumber) {
    let mut alloc = &m.frames;
    let kernel = m.kernel_space();
    let mut space = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
    let page = alloc.alloc_4k().unwrap();
    m.phys.fill(page, 0x5A);
    space
        .map(&mut alloc, USER_VA, page, PageEntryBits::user_rw())
        .unwrap();
    let parent = Task::bootstrap(&mut alloc, Some(space)).unwrap();
    (kernel, parent, page)
}

fn initial_frame<T: Copy>(m: &TestMachine, task: &Task<'_, TestPhys>) -> T {
    let size = size_of::<T>() as u64;
    assert_eq!(
        task.rsp_top(),
        VirtualAddress::new(task.rsp_original().as_u64() - size)
    );
    unsafe { *m.phys.phys_to_mut::<T>(task.kernel_stack().below_top(size)) }
}

#[test]
fn user_fork_builds_an_iret_frame() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, page) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let mut alloc = &m.frames;
    let child = tasks
        .fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS)
        .unwrap();

    assert!(child.pid() > parent.pid());
    assert_eq!(child.state(), TaskState::Runnable);
    assert!(!child.is_kernel_thread());
    assert!(Arc::ptr_eq(&scheduler.0.lock().unwrap()[0], &child));

    let frame: UserForkFrame = initial_frame(&m, &child);
    assert_eq!(frame.iret.rip, ENTRY.as_u64());
    assert_eq!(frame.iret.rsp, REGS.rsp);
    assert_eq!(frame.iret.cs, 0x28 | 3);
    assert_eq!(frame.iret.ss, 0x20 | 3);
    assert_eq!(frame.iret.rflags, 0x202);
    assert_eq!(frame.resume, RESUME.user_fork.as_u64());
    assert_eq!(
        frame.saved,
        SavedFrame {
            r15: 6,
            r14: 5,
            r13: 4,
            r12: 3,
            rbp: 2,
            rbx: 1,
        }
    );

    let p = parent.address_space().unwrap().lock().translate(USER_VA).unwrap();
    let c = child.address_space().unwrap().lock().translate(USER_VA).unwrap();
    assert_eq!(p.frame, page);
    assert_eq!(c.frame, page);
    assert!(!p.flags.writable() && !c.flags.writable());
}

#[test]
fn kernel_thread_has_no_address_space() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, _) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);
    let entry = VirtualAddress::new(0xffff_ffff_8012_3450);

    let mut alloc = &m.frames;
    let before = m.free_frames();
    let thread = tasks
        .fork(
            &mut alloc,
            &parent,
            entry,
            TaskFlags::new().with_kernel_thread(true),
            &CalleeSavedRegisters::default(),
        )
        .unwrap();

    assert!(thread.is_kernel_thread());
    assert!(!thread.has_address_space());
    assert_eq!(m.free_frames(), before - 2, "only the kernel stack");

    let frame: KernelThreadFrame = initial_frame(&m, &thread);
    assert_eq!(frame.entry, entry.as_u64());
    assert_eq!(frame.resume, RESUME.kernel_thread.as_u64());
    assert_eq!(frame.saved, SavedFrame::default());
}

#[test]
fn user_fork_needs_a_parent_image() {
    let m = TestMachine::new(1024);
    let mut alloc = &m.frames;
    let idle = Task::<TestPhys>::bootstrap(&mut alloc, None).unwrap();
    assert!(idle.is_kernel_thread());

    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);
    let before = m.free_frames();
    assert!(matches!(
        tasks.fork(&mut alloc, &idle, ENTRY, TaskFlags::new(), &REGS),
        Err(ForkError::ParentHasNoAddressSpace)
    ));
    assert_eq!(m.free_frames(), before);
    assert!(scheduler.0.lock().unwrap().is_empty());
}

#[test]
fn fork_fails_without_frames() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, _) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let mut alloc = &m.frames;
    let mut hoard = Vec::new();
    while let Ok(frame) = alloc.alloc_4k() {
        hoard.push(frame);
    }

    assert!(matches!(
        tasks.fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS),
        Err(ForkError::Frames(FrameAllocError::FrameExhausted { order: 1 }))
    ));
    assert!(scheduler.0.lock().unwrap().is_empty());

    // Room for the stack (two aligned frames) but not for the clone.
    let stack_room: Vec<_> = hoard
        .iter()
        .copied()
        .filter(|f| f.as_u64() % 2 == 0 && hoard.contains(&(*f + 1)))
        .take(1)
        .collect();
    for base in stack_room {
        alloc.free(base, 0).unwrap();
        alloc.free(base + 1, 0).unwrap();
    }
    let before = m.free_frames();
    assert!(matches!(
        tasks.fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS),
        Err(ForkError::Clone(_))
    ));
    assert_eq!(m.free_frames(), before, "stack returned after failed clone");
}

#[test]
fn concurrent_forks_get_strictly_increasing_pids() {
    const THREADS: usize = 4;
    const FORKS: usize = 16;

    let m = TestMachine::new(1024);
    let (_kernel, parent, _) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);
    let barrier = Barrier::new(THREADS);

    let per_thread: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    let mut alloc = &m.frames;
                    barrier.wait();
                    (0..FORKS)
                        .map(|_| {
                            let child = tasks
                                .fork(
                                    &mut alloc,
                                    &parent,
                                    ENTRY,
                                    TaskFlags::new().with_kernel_thread(true),
                                    &REGS,
                                )
                                .unwrap();
                            child.pid().as_u64()
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for pids in &per_thread {
        assert!(pids.windows(2).all(|w| w[0] < w[1]));
        for pid in pids {
            assert!(seen.insert(*pid), "pid {pid} handed out twice");
            assert!(*pid > parent.pid().as_u64());
        }
    }
    assert_eq!(seen.len(), THREADS * FORKS);
    assert_eq!(scheduler.0.lock().unwrap().len(), THREADS * FORKS);
}

#[test]
fn reaping_a_child_returns_its_frames() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, page) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let mut alloc = &m.frames;
    let before = m.free_frames();
    let child = tasks
        .fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS)
        .unwrap();
    assert_eq!(alloc.ref_count(page), 2);

    scheduler.drain();
    let child = Arc::try_unwrap(child).ok().unwrap();
    child.reap(&mut alloc).unwrap();

    assert_eq!(m.free_frames(), before);
    assert_eq!(alloc.ref_count(page), 1);
}

#[test]
fn threads_share_the_parent_space() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, page) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let mut alloc = &m.frames;
    let before = m.free_frames();
    let thread = tasks.spawn_thread(&mut alloc, &parent, ENTRY, &REGS).unwrap();

    assert!(!thread.is_kernel_thread());
    assert!(Arc::ptr_eq(
        &parent.address_space().unwrap(),
        &thread.address_space().unwrap()
    ));
    assert_eq!(m.free_frames(), before - 2, "only the kernel stack");
    assert_eq!(alloc.ref_count(page), 1);

    let frame: UserForkFrame = initial_frame(&m, &thread);
    assert_eq!(frame.iret.rip, ENTRY.as_u64());
    assert_eq!(frame.iret.rsp, REGS.rsp);

    // Writes stay visible to both without a copy.
    let t = thread.address_space().unwrap().lock().translate(USER_VA).unwrap();
    assert_eq!(t.frame, page);
    assert!(t.flags.writable());
}

#[test]
fn reaping_one_thread_keeps_the_shared_space() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, page) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let mut alloc = &m.frames;
    let before = m.free_frames();
    let thread = tasks.spawn_thread(&mut alloc, &parent, ENTRY, &REGS).unwrap();
    scheduler.drain();

    let thread = Arc::try_unwrap(thread).ok().unwrap();
    thread.reap(&mut alloc).unwrap();
    assert_eq!(m.free_frames(), before);
    assert_eq!(alloc.ref_count(page), 1);
    assert_eq!(
        parent.address_space().unwrap().lock().translate(USER_VA).map(|t| t.frame),
        Some(page)
    );

    // The last user takes the space with it.
    parent.reap(&mut alloc).unwrap();
    assert!(!m.frames.lock().is_claimed(page));
}

#[test]
fn threads_need_a_parent_image() {
    let m = TestMachine::new(1024);
    let mut alloc = &m.frames;
    let idle = Task::<TestPhys>::bootstrap(&mut alloc, None).unwrap();
    let scheduler = RecordingScheduler::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &LocalShootdown);

    let before = m.free_frames();
    assert!(matches!(
        tasks.spawn_thread(&mut alloc, &idle, ENTRY, &REGS),
        Err(ForkError::ParentHasNoAddressSpace)
    ));
    assert_eq!(m.free_frames(), before);
}

#[test]
fn forking_a_threaded_parent_flushes_every_processor() {
    let m = TestMachine::new(1024);
    let (_kernel, parent, _) = user_parent(&m);
    let scheduler = RecordingScheduler::default();
    let shootdown = CountingShootdown::default();
    let tasks = TaskConstructor::new(&m.phys, RESUME, &scheduler, &shootdown);

    let mut alloc = &m.frames;
    tasks
        .fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS)
        .unwrap();
    assert_eq!(shootdown.0.load(Ordering::Relaxed), 0, "single-threaded parent");

    let _thread = tasks.spawn_thread(&mut alloc, &parent, ENTRY, &REGS).unwrap();
    tasks
        .fork(&mut alloc, &parent, ENTRY, TaskFlags::new(), &REGS)
        .unwrap();
    assert_eq!(shootdown.0.load(Ordering::Relaxed), 1);
}
