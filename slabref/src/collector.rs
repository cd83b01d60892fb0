//! Deferred destruction of unreferenced objects.
//!
//! A node whose count drops to zero is pushed onto a global intrusive list
//! instead of being destroyed in the releasing call. Whoever claims the
//! collector (the background thread, `gc()`, or a releasing thread that finds
//! the backlog over its limit) swaps the whole list out and destroys it.
//! Destructors that release further objects only push onto the list again,
//! so destruction never recurses.
//!
//! Pushes are CAS onto `head`; the only removal is a whole-list swap, which
//! cannot suffer ABA.

use crate::config;
use crate::event::Semaphore;
use crate::object::Header;
use crate::thread_id::{NO_THREAD, ThreadToken};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use once_cell::race::OnceBox;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Collector counters, see [`Ref::collector_stats`](crate::Ref::collector_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Objects currently referenced.
    pub live: usize,
    /// Unreferenced objects waiting for destruction.
    pub pending: usize,
    /// Objects destroyed.
    pub destroyed: usize,
    /// Collection passes run.
    pub passes: usize,
    /// Destructors that panicked.
    pub panics: usize,
}

pub(crate) struct Collector {
    head: AtomicPtr<Header>,
    /// Token of the thread running a pass, or `NO_THREAD`.
    owner: AtomicU64,

    live: AtomicUsize,
    pending: AtomicUsize,
    destroyed: AtomicUsize,
    passes: AtomicUsize,
    panics: AtomicUsize,

    /// Signalled whenever a pass ends.
    idle: Mutex<()>,
    idle_cv: Condvar,
    /// Wakes the background thread.
    wake: Semaphore,
}

static COLLECTOR: OnceBox<Collector> = OnceBox::new();
static WORKER: OnceCell<bool> = OnceCell::new();

#[inline]
pub(crate) fn collector() -> &'static Collector {
    COLLECTOR.get_or_init(|| Box::new(Collector::new()))
}

impl Collector {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicU64::new(NO_THREAD),
            live: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            passes: AtomicUsize::new(0),
            panics: AtomicUsize::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            wake: Semaphore::new(0),
        }
    }

    /// An object went from unreferenced to referenced.
    #[inline]
    pub(crate) fn referenced(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue an unreferenced node for destruction.
    ///
    /// # Safety
    ///
    /// `header` must have just dropped to zero references.
    pub(crate) unsafe fn retire(&self, header: NonNull<Header>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;

        let node = header.as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: nobody else can reach an unreferenced node.
            unsafe { (*node).reclaim.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let config = &config::get().collector;
        if pending > config.backlog_limit || !(config.background && self.start_worker()) {
            self.collect();
        } else if head.is_null() {
            self.wake.post();
        }
    }

    fn start_worker(&self) -> bool {
        *WORKER.get_or_init(|| {
            match thread::Builder::new()
                .name("slabref-collector".into())
                .spawn(|| {
                    let collector = collector();
                    loop {
                        collector.wake.wait();
                        collector.collect();
                    }
                }) {
                Ok(_) => {
                    info!("background collector started");
                    true
                }
                Err(err) => {
                    warn!(%err, "background collector unavailable, collecting inline");
                    false
                }
            }
        })
    }

    /// Run one pass unless another is already running.
    ///
    /// Returns whether this call ran the pass.
    pub(crate) fn collect(&self) -> bool {
        let token = ThreadToken::current().as_u64();
        if self
            .owner
            .compare_exchange(NO_THREAD, token, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let mut destroyed = 0usize;
        loop {
            let mut next = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
            if next.is_null() {
                break;
            }
            while let Some(header) = NonNull::new(next) {
                // SAFETY: the list owns every node on it.
                next = unsafe { header.as_ref().reclaim.load(Ordering::Relaxed) };
                self.pending.fetch_sub(1, Ordering::Relaxed);
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| unsafe { Header::destroy(header) }));
                if let Err(payload) = outcome {
                    self.panics.fetch_add(1, Ordering::Relaxed);
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    error!(node = ?header, %message, "object destructor panicked");
                }
                destroyed += 1;
            }
        }

        self.destroyed.fetch_add(destroyed, Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);
        trace!(destroyed, "collection pass");

        {
            let _idle = self.idle.lock();
            self.owner.store(NO_THREAD, Ordering::SeqCst);
        }
        self.idle_cv.notify_all();

        // Anything pushed after the last swap found a pass running, and a
        // worker woken meanwhile lost the claim to us. Hand it over.
        if !self.head.load(Ordering::SeqCst).is_null() && self.has_worker() {
            self.wake.post();
        }
        true
    }

    #[inline]
    fn has_worker(&self) -> bool {
        WORKER.get().copied().unwrap_or(false)
    }

    /// Collect until nothing is pending and no pass is running.
    ///
    /// Returns `false` without waiting when called from inside a pass (that
    /// is, from a destructor).
    pub(crate) fn gc(&self) -> bool {
        let token = ThreadToken::current().as_u64();
        loop {
            self.collect();

            let mut idle = self.idle.lock();
            // Head before owner: an empty list seen first means any pass that
            // emptied it still holds the claim when the owner is read.
            let empty = self.head.load(Ordering::SeqCst).is_null();
            let owner = self.owner.load(Ordering::SeqCst);
            if owner == token {
                return false;
            }
            if owner == NO_THREAD {
                if empty {
                    return true;
                }
                continue;
            }
            self.idle_cv.wait(&mut idle);
        }
    }

    pub(crate) fn stats(&self) -> CollectorStats {
        CollectorStats {
            live: self.live.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn debug(&self) {
        let stats = self.stats();
        debug!(
            live = stats.live,
            pending = stats.pending,
            destroyed = stats.destroyed,
            passes = stats.passes,
            panics = stats.panics,
            collecting = self.owner.load(Ordering::Relaxed) != NO_THREAD,
            background = self.has_worker(),
            "collector"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefT;
    use crate::object::Object;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    struct Flagged(Arc<AtomicBool>);
    impl Object for Flagged {}
    impl Drop for Flagged {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn gc_destroys_everything_queued_before_it() {
        let flags: Vec<_> = (0..16).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let refs: Vec<_> = flags
            .iter()
            .map(|flag| RefT::new(Flagged(flag.clone())))
            .collect();
        drop(refs);

        assert!(collector().gc());
        assert!(flags.iter().all(|flag| flag.load(Ordering::SeqCst)));
    }

    struct Panicky;
    impl Object for Panicky {}
    impl Drop for Panicky {
        fn drop(&mut self) {
            panic!("destructor failure");
        }
    }

    #[test]
    fn panicking_destructor_does_not_stop_the_pass() {
        let flag = Arc::new(AtomicBool::new(false));
        let before = collector().stats().panics;
        drop(RefT::new(Panicky));
        drop(RefT::new(Flagged(flag.clone())));

        assert!(collector().gc());
        assert!(flag.load(Ordering::SeqCst));
        assert!(collector().stats().panics > before);
    }

    struct Counted(Arc<AtomicUsize>);
    impl Object for Counted {}
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn background_worker_drains_after_competing_passes() {
        assert!(collector().start_worker());
        let dropped = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let competitor = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    collector().collect();
                }
            })
        };
        let producer = {
            let stop = stop.clone();
            let dropped = dropped.clone();
            thread::spawn(move || {
                let mut made = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    drop(RefT::new(Counted(dropped.clone())));
                    made += 1;
                }
                made
            })
        };

        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        competitor.join().unwrap();
        let mut made = producer.join().unwrap();

        thread::sleep(Duration::from_millis(20));
        for _ in 0..1_000 {
            drop(RefT::new(Counted(dropped.clone())));
            made += 1;
        }

        // No gc() here: only the background thread may drain the rest.
        let deadline = Instant::now() + Duration::from_secs(10);
        while dropped.load(Ordering::SeqCst) < made && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dropped.load(Ordering::SeqCst), made);
    }

    struct Nested(Arc<AtomicBool>);
    impl Object for Nested {}
    impl Drop for Nested {
        fn drop(&mut self) {
            self.0.store(collector().gc(), Ordering::SeqCst);
        }
    }

    #[test]
    fn gc_inside_a_destructor_returns_immediately() {
        let finished = Arc::new(AtomicBool::new(true));
        drop(RefT::new(Nested(finished.clone())));
        assert!(collector().gc());
        assert!(!finished.load(Ordering::SeqCst));
    }
}
