//! Latches: minimal mutual-exclusion words with no wait queue.
//!
//! - [`Latch`]: exclusive, non-reentrant spin latch.
//! - [`RecursiveLatch`]: reentrant, owned by a thread identity.
//! - [`SharedLatch`] / [`ExclusiveLatch`]: reader/writer pair over one word.
//!
//! None of these fail or time out; contention is resolved by spinning with
//! backoff. Unlocking a latch the caller does not hold breaks mutual
//! exclusion and is a contract violation, not a checked error.

use crate::backoff::Backoff;
use crate::config;
use crate::thread_id::{NO_THREAD, ThreadToken};
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Lock interface shared by every latch, usable with [`LatchGuard`].
pub trait RawLatch {
    /// Acquire, spinning until available.
    fn lock(&self);

    /// Acquire if immediately available.
    fn try_lock(&self) -> bool;

    /// Release. The caller must hold the latch.
    fn unlock(&self);

    /// Acquire and return a scoped guard that releases on drop.
    #[inline]
    fn guard(&self) -> LatchGuard<'_, Self>
    where
        Self: Sized,
    {
        LatchGuard::new(self)
    }
}

/// Scoped lock: holds a latch from construction until drop.
#[must_use = "the latch is released as soon as the guard is dropped"]
pub struct LatchGuard<'a, L: RawLatch> {
    latch: &'a L,
}

impl<'a, L: RawLatch> LatchGuard<'a, L> {
    /// Acquire `latch`.
    #[inline]
    pub fn new(latch: &'a L) -> Self {
        latch.lock();
        Self { latch }
    }

    /// Acquire `latch` only if it is immediately available.
    #[inline]
    pub fn try_new(latch: &'a L) -> Option<Self> {
        latch.try_lock().then_some(Self { latch })
    }
}

impl<L: RawLatch> Drop for LatchGuard<'_, L> {
    #[inline]
    fn drop(&mut self) {
        self.latch.unlock();
    }
}

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

const RESET: i32 = 0;
const LOCKED: i32 = -1;

/// Exclusive, non-reentrant spin latch. One word: RESET(0) or LOCKED(-1).
pub struct Latch {
    word: AtomicI32,
}

impl Latch {
    /// A reset latch.
    pub const fn new() -> Self {
        Self {
            word: AtomicI32::new(RESET),
        }
    }

    /// Force the latch to RESET regardless of its state.
    ///
    /// The caller guarantees no thread currently holds it.
    #[inline]
    pub fn reset(&self) {
        self.word.store(RESET, Ordering::Release);
    }

    /// Whether some thread holds the latch (instantaneous).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }
}

impl RawLatch for Latch {
    #[inline]
    fn lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            // Test phase: spin on a relaxed load (stays in cache)
            while self.is_locked() {
                backoff.snooze();
            }
            if self.try_lock() {
                return;
            }
            backoff.snooze();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(RESET, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.word.store(RESET, Ordering::Release);
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("word", &self.word.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RecursiveLatch
// ---------------------------------------------------------------------------

/// Reentrant latch owned by a thread.
///
/// `depth > 0` implies `owner` is the holding thread's identity. The owner
/// word returns to the sentinel only when the outermost `unlock` runs.
pub struct RecursiveLatch {
    owner: AtomicU64,
    // Only the owning thread touches this.
    depth: AtomicU32,
}

impl RecursiveLatch {
    /// An unowned latch.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_THREAD),
            depth: AtomicU32::new(0),
        }
    }

    /// Force the latch to the unowned state.
    ///
    /// The caller guarantees no thread currently holds it.
    pub fn reset(&self) {
        self.depth.store(0, Ordering::Relaxed);
        self.owner.store(NO_THREAD, Ordering::Release);
    }

    /// Current nesting depth when held by the calling thread, else 0.
    pub fn depth(&self) -> u32 {
        if self.is_held_by_current_thread() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Whether the calling thread holds the latch at any nesting level.
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == ThreadToken::current().as_u64()
    }
}

impl RawLatch for RecursiveLatch {
    fn lock(&self) {
        let pause = Duration::from_nanos(config::get().latch.recursive_sleep_nanos);
        while !self.try_lock() {
            thread::sleep(pause);
        }
    }

    fn try_lock(&self) -> bool {
        let me = ThreadToken::current().as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self
            .owner
            .compare_exchange(NO_THREAD, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn unlock(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(depth > 0, "RecursiveLatch unlocked while not held");
        if depth == 1 {
            self.owner.store(NO_THREAD, Ordering::Release);
        }
    }
}

impl Default for RecursiveLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecursiveLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveLatch")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SharedLatch / ExclusiveLatch
// ---------------------------------------------------------------------------

const EXCLUSIVE: u32 = 0x8000_0000;
const SHARERS: u32 = !EXCLUSIVE;

/// Shared (reader) side of a reader/writer latch.
///
/// The low 31 bits count shared holders; the top bit flags an exclusive
/// holder. The two are never set together.
pub struct SharedLatch {
    count: AtomicU32,
}

impl SharedLatch {
    /// An unheld latch.
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// The exclusive view over this latch.
    #[inline]
    pub fn exclusive(&self) -> ExclusiveLatch<'_> {
        ExclusiveLatch { shared: self }
    }

    /// Force the latch to the unheld state.
    ///
    /// The caller guarantees no thread currently holds it.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Number of shared holders (instantaneous).
    #[inline]
    pub fn sharers(&self) -> u32 {
        self.count.load(Ordering::Relaxed) & SHARERS
    }

    /// Whether an exclusive holder owns the latch (instantaneous).
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.count.load(Ordering::Relaxed) & EXCLUSIVE != 0
    }
}

impl RawLatch for SharedLatch {
    fn lock(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }
    }

    fn try_lock(&self) -> bool {
        // Expecting the masked value makes the CAS fail while the bit is set.
        let old = self.count.load(Ordering::Relaxed) & SHARERS;
        if old == SHARERS {
            return false;
        }
        self.count
            .compare_exchange(old, old + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        let old = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(old & SHARERS != 0, "SharedLatch unlocked while not held");
    }
}

impl Default for SharedLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLatch")
            .field("sharers", &self.sharers())
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Exclusive (writer) view over a [`SharedLatch`]: all or nothing.
#[derive(Clone, Copy)]
pub struct ExclusiveLatch<'a> {
    shared: &'a SharedLatch,
}

impl<'a> ExclusiveLatch<'a> {
    /// The exclusive view over `shared`.
    pub fn new(shared: &'a SharedLatch) -> Self {
        Self { shared }
    }
}

impl RawLatch for ExclusiveLatch<'_> {
    fn lock(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }
    }

    fn try_lock(&self) -> bool {
        self.shared
            .count
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Reset the word to zero.
    ///
    /// Exclusive ownership is only granted from an all-zero word, so zero is
    /// the prior state; anything else here means the contract was broken.
    fn unlock(&self) {
        let old = self.shared.count.swap(0, Ordering::Release);
        assert_eq!(
            old, EXCLUSIVE,
            "ExclusiveLatch unlocked while not exclusively held (word {old:#x})"
        );
    }
}

impl fmt::Debug for ExclusiveLatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExclusiveLatch").field(self.shared).finish()
    }
}
