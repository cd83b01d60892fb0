//! A value owned by a [`Latch`].

use crate::latch::{Latch, LatchGuard, RawLatch};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A `T` reachable only while its latch is held.
///
/// ```
/// use slabref::Latched;
///
/// let words = Latched::new(Vec::new());
/// words.lock().push("latch");
/// assert_eq!(words.lock().len(), 1);
/// assert_eq!(words.into_inner(), ["latch"]);
/// ```
pub struct Latched<T: ?Sized> {
    latch: Latch,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reached through a held latch or `&mut self`.
unsafe impl<T: ?Sized + Send> Send for Latched<T> {}
unsafe impl<T: ?Sized + Send> Sync for Latched<T> {}

impl<T> Latched<T> {
    /// Wrap `value` behind a reset latch.
    pub const fn new(value: T) -> Self {
        Self {
            latch: Latch::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Latched<T> {
    /// Hold the latch until the returned view is dropped.
    #[inline]
    pub fn lock(&self) -> Held<'_, T> {
        self.view(LatchGuard::new(&self.latch))
    }

    /// Like [`lock`](Self::lock), but only if the latch is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<Held<'_, T>> {
        LatchGuard::try_new(&self.latch).map(|guard| self.view(guard))
    }

    #[inline]
    fn view<'a>(&'a self, guard: LatchGuard<'a, Latch>) -> Held<'a, T> {
        Held {
            // SAFETY: `guard` excludes every other view for as long as it lives.
            value: unsafe { &mut *self.value.get() },
            _guard: guard,
        }
    }

    /// Whether some thread holds the latch (diagnostics only).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.latch.is_locked()
    }

    /// The value through `&mut self`, without latching.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for Latched<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Latched<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latched")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Access to a [`Latched`] value. The latch is released on drop.
#[must_use = "the latch is released as soon as the view is dropped"]
pub struct Held<'a, T: ?Sized> {
    value: &'a mut T,
    _guard: LatchGuard<'a, Latch>,
}

impl<T: ?Sized> Deref for Held<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.value
    }
}

impl<T: ?Sized> DerefMut for Held<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn views_serialize_updates() {
        let counter = Arc::new(Latched::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
        assert!(!counter.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let cell = Latched::new(1u8);
        let held = cell.lock();
        assert!(cell.is_locked());
        assert!(cell.try_lock().is_none());
        drop(held);
        *cell.try_lock().unwrap() += 1;
        assert_eq!(cell.into_inner(), 2);
    }
}
