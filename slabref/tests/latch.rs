//! Mutual exclusion tests for the latch family.
//!
//! Counters here are plain (non-atomic) integers: only the latch keeps the
//! increments from racing.

use slabref::{ExclusiveLatch, Latch, LatchGuard, RawLatch, RecursiveLatch, SharedLatch};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

struct Counter<L> {
    latch: L,
    value: UnsafeCell<usize>,
}

unsafe impl<L: Sync> Sync for Counter<L> {}

impl<L: RawLatch> Counter<L> {
    fn new(latch: L) -> Self {
        Self {
            latch,
            value: UnsafeCell::new(0),
        }
    }

    fn bump(&self) {
        let _guard = LatchGuard::new(&self.latch);
        unsafe { *self.value.get() += 1 };
    }

    fn read(&self) -> usize {
        let _guard = LatchGuard::new(&self.latch);
        unsafe { *self.value.get() }
    }
}

fn hammer<L: RawLatch + Send + Sync + 'static>(make: fn() -> L) {
    for threads in [1usize, 2, 8, 64] {
        for count in [1usize, 1000] {
            let counter = Arc::new(Counter::new(make()));
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let counter = counter.clone();
                    thread::spawn(move || {
                        for _ in 0..count {
                            counter.bump();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(
                counter.read(),
                threads * count,
                "{threads} threads x {count} increments"
            );
        }
    }
}

#[test]
fn latch_excludes() {
    hammer(Latch::new);
}

#[test]
fn recursive_latch_excludes() {
    hammer(RecursiveLatch::new);
}

#[test]
fn shared_latch_exclusive_view_excludes() {
    let shared = Arc::new(SharedLatch::new());
    let value = Arc::new(Counter::new(Latch::new()));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = shared.clone();
            let value = value.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let exclusive = ExclusiveLatch::new(&shared);
                    let _guard = exclusive.guard();
                    // Bump without the inner latch's help.
                    unsafe { *value.value.get() += 1 };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(value.read(), 8000);
    assert_eq!(shared.sharers(), 0);
    assert!(!shared.is_exclusive());
}

#[test]
fn sharers_hold_the_latch_simultaneously() {
    const READERS: usize = 8;
    let shared = Arc::new(SharedLatch::new());
    let barrier = Arc::new(Barrier::new(READERS + 1));
    let release = Arc::new(Barrier::new(READERS + 1));

    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let shared = shared.clone();
            let barrier = barrier.clone();
            let release = release.clone();
            thread::spawn(move || {
                let _guard = shared.guard();
                barrier.wait();
                release.wait();
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(shared.sharers(), READERS as u32);
    assert!(!shared.exclusive().try_lock());
    release.wait();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(shared.sharers(), 0);
    assert!(shared.exclusive().try_lock());
    shared.exclusive().unlock();
}

#[test]
fn readers_and_writers_never_overlap() {
    let shared = Arc::new(SharedLatch::new());
    let writing = Arc::new(AtomicBool::new(false));
    let reading = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..8 {
        let shared = shared.clone();
        let writing = writing.clone();
        let reading = reading.clone();
        let violations = violations.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                if id % 4 == 0 {
                    let exclusive = shared.exclusive();
                    let _guard = exclusive.guard();
                    writing.store(true, Ordering::SeqCst);
                    if reading.load(Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    writing.store(false, Ordering::SeqCst);
                } else {
                    let _guard = shared.guard();
                    reading.fetch_add(1, Ordering::SeqCst);
                    if writing.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    reading.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn recursive_latch_must_be_released_once_per_acquire() {
    const DEPTH: u32 = 5;
    let latch = Arc::new(RecursiveLatch::new());
    for _ in 0..DEPTH {
        latch.lock();
    }
    assert_eq!(latch.depth(), DEPTH);
    assert!(latch.is_held_by_current_thread());

    let other_can_lock = |latch: &Arc<RecursiveLatch>| {
        let latch = latch.clone();
        thread::spawn(move || {
            let got = latch.try_lock();
            if got {
                latch.unlock();
            }
            got
        })
        .join()
        .unwrap()
    };

    for remaining in (1..=DEPTH).rev() {
        assert!(!other_can_lock(&latch), "other thread acquired at depth {remaining}");
        latch.unlock();
    }
    assert_eq!(latch.depth(), 0);
    assert!(other_can_lock(&latch));
}

#[test]
fn blocked_lock_proceeds_after_release() {
    let latch = Arc::new(Latch::new());
    latch.lock();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let latch = latch.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            let _guard = latch.guard();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!acquired.load(Ordering::SeqCst));
    latch.unlock();
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(!latch.is_locked());
}
