use kernel_alloc::{BitmapFrameAlloc, FrameAlloc, FrameAllocError};
use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

/// Each thread allocates until exhaustion; the claimed ranges must be
/// pairwise disjoint and together cover the whole pool.
#[test]
fn concurrent_allocations_never_overlap() {
    const THREADS: usize = 8;

    for order in [0u8, 1, 3] {
        let pool: &'static SpinLock<BitmapFrameAlloc> =
            Box::leak(Box::new(SpinLock::new(BitmapFrameAlloc::new(1024))));
        let start = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let mut frames = pool;
                    let mut mine = Vec::new();
                    start.wait();
                    loop {
                        match frames.allocate(order) {
                            Ok(frame) => mine.push(frame),
                            Err(FrameAllocError::FrameExhausted { .. }) => break mine,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();

        let mut claimed = BTreeSet::new();
        for h in handles {
            for base in h.join().unwrap() {
                for i in 0..1u64 << order {
                    assert!(
                        claimed.insert(base.as_u64() + i),
                        "frame {} handed out twice at order {order}",
                        base.as_u64() + i
                    );
                }
            }
        }

        assert_eq!(claimed.len(), 1024);
        assert_eq!(pool.with_lock(|p| p.free_frames()), 0);
    }
}

#[test]
fn concurrent_free_and_allocate_keep_counts_consistent() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let pool: &'static SpinLock<BitmapFrameAlloc> =
        Box::leak(Box::new(SpinLock::new(BitmapFrameAlloc::new(256))));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut frames = pool;
                start.wait();
                for _ in 0..ROUNDS {
                    let a = frames.allocate(1).unwrap();
                    let b = frames.alloc_4k().unwrap();
                    assert_ne!(a, b);
                    assert_eq!(frames.share(b), Ok(2));
                    assert_eq!(frames.release(b), Ok(1));
                    frames.free(b, 0).unwrap();
                    frames.free(a, 1).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let mut frames = pool;
    assert_eq!(pool.with_lock(|p| p.free_frames()), 256);
    assert_eq!(frames.allocate(8), Ok(FrameNumber::new(0)));
}
