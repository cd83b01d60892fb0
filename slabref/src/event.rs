//! Condition-variable backed wait/post primitives.
//!
//! Both loop on their predicate while waiting, so spurious wakeups are
//! harmless. Neither supports timeouts or cancellation.

use parking_lot::{Condvar, Mutex};

/// A single flag: `wait()` blocks until some thread calls `post()`.
///
/// The flag stays posted until `reset()`.
#[derive(Debug, Default)]
pub struct Event {
    posted: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    /// A reset event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.cv.notify_all();
    }

    /// Block until the flag is set.
    pub fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.cv.wait(&mut posted);
        }
    }

    /// Clear the flag.
    pub fn reset(&self) {
        *self.posted.lock() = false;
    }

    /// Whether the flag is set.
    pub fn is_posted(&self) -> bool {
        *self.posted.lock()
    }
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// A semaphore holding `initial` permits.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Add one permit, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit if one is available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn event_releases_all_waiters() {
        let event = Arc::new(Event::new());
        let woke = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                let woke = woke.clone();
                thread::spawn(move || {
                    event.wait();
                    woke.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(woke.load(Ordering::SeqCst), 0);
        event.post();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 4);

        assert!(event.is_posted());
        event.reset();
        assert!(!event.is_posted());
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        sem.wait();
        assert!(!sem.try_wait());
        sem.post();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn semaphore_hands_off_between_threads() {
        let sem = Arc::new(Semaphore::new(0));
        let consumer = {
            let sem = sem.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    sem.wait();
                }
            })
        };
        for _ in 0..100 {
            sem.post();
        }
        consumer.join().unwrap();
        assert_eq!(sem.available(), 0);
    }
}
