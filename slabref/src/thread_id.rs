//! Thread identity.
//!
//! `std::thread::ThreadId` cannot be stored in an atomic word, so each thread
//! lazily takes a nonzero token from a global counter. Zero is the "no owner"
//! sentinel used by [`RecursiveLatch`](crate::RecursiveLatch) and the collector.

use core::cell::Cell;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};

/// The "no owner" identity word.
pub(crate) const NO_THREAD: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TOKEN: Cell<u64> = const { Cell::new(NO_THREAD) };
}

/// Identity of an OS thread, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(NonZeroU64);

impl ThreadToken {
    /// Token of the calling thread.
    #[inline]
    pub fn current() -> Self {
        TOKEN.with(|token| {
            let mut value = token.get();
            if value == NO_THREAD {
                value = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
                token.set(value);
            }
            // The counter starts at 1 and is 64 bits wide.
            Self(NonZeroU64::new(value).unwrap_or(NonZeroU64::MIN))
        })
    }

    /// Raw identity word.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn token_is_stable_within_a_thread() {
        assert_eq!(ThreadToken::current(), ThreadToken::current());
        assert_ne!(ThreadToken::current().as_u64(), NO_THREAD);
    }

    #[test]
    fn tokens_differ_across_threads() {
        let here = ThreadToken::current();
        let there = thread::spawn(ThreadToken::current).join().unwrap();
        assert_ne!(here, there);
    }
}
