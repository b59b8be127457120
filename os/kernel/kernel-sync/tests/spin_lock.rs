use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }

    // previous drop must have unlocked
    assert!(!l.is_locked());
    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());

    // while held, try_lock must fail without disturbing the holder
    assert!(l.try_lock().is_none());
    assert!(l.is_locked());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(vec![1u64, 2]);
    let len = l.with_lock(|v| {
        v.push(3);
        v.len()
    });
    assert_eq!(len, 3);
    assert_eq!(l.into_inner(), vec![1, 2, 3]);
}

#[test]
fn contended_claims_are_exclusive() {
    let threads = 8;
    let iters = 2_000;

    // A tiny bitmap: every thread claims a bit, checks it was clear, and
    // clears it again, all under the lock.
    let bitmap = Arc::new(SpinLock::new(0u64));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let claims = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let bitmap = Arc::clone(&bitmap);
            let in_cs = Arc::clone(&in_cs);
            let claims = Arc::clone(&claims);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    bitmap.with_lock(|bits| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        let bit = 1u64 << t;
                        assert_eq!(*bits & bit, 0);
                        *bits |= bit;
                        claims.fetch_add(1, Ordering::Relaxed);
                        *bits &= !bit;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(claims.load(Ordering::Relaxed), threads * iters);
    assert_eq!(bitmap.with_lock(|b| *b), 0);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn debug_does_not_deadlock_while_held() {
    let l = SpinLock::new(7u8);
    assert_eq!(format!("{l:?}"), "SpinLock { data: 7 }");
    let _g = l.lock();
    assert_eq!(format!("{l:?}"), "SpinLock { <locked> }");
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
