//! Counted references: [`Ref`] over any [`Object`], [`RefT`] over one type.
//!
//! A reference holds one count on its target. Reassignment takes the count
//! on the new target before giving up the old one, so assigning a reference
//! to itself (or to another reference to the same object) is safe.
//!
//! When the last reference goes away the object is queued for the collector
//! rather than destroyed in place. [`Ref::gc`] waits for the queue to drain.

use crate::allocator::Allocator;
use crate::collector::{CollectorStats, collector};
use crate::error::{Error, Result};
use crate::object::{Header, Node, Object};
use alloc::sync::Arc;
use core::cmp::Ordering as CmpOrdering;
use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use tracing::error;

/// Take a reference on `header`.
#[inline]
fn acquire(header: NonNull<Header>) -> Result<()> {
    // SAFETY: callers pass a node they already hold a reference to, or a
    // fresh one nobody else can see.
    if unsafe { header.as_ref() }.acquire()? {
        collector().referenced();
    }
    Ok(())
}

/// Like [`acquire`] for paths that cannot report errors.
#[inline]
fn acquire_or_abort(header: NonNull<Header>) {
    if let Err(err) = acquire(header) {
        error!(%err, node = ?header, "reference count overflow");
        std::process::abort();
    }
}

/// Give up a reference on `header`.
#[inline]
fn release(header: NonNull<Header>) {
    // SAFETY: the caller held a reference, so the node is live.
    if unsafe { header.as_ref() }.release() {
        unsafe { collector().retire(header) };
    }
}

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// A counted reference to any [`Object`], possibly empty.
///
/// ```
/// use slabref::{Object, Ref};
///
/// struct Greeting;
/// impl Object for Greeting {
///     fn string(&self) -> String {
///         "hello".into()
///     }
/// }
///
/// let mut r = Ref::from_object(Greeting);
/// assert_eq!(r.target().unwrap().string(), "hello");
///
/// let copy = r.clone();
/// assert_eq!(r.references(), Some(2));
///
/// r.clear();
/// assert!(r.target().is_err());
/// assert_eq!(copy.references(), Some(1));
/// ```
pub struct Ref {
    node: Option<NonNull<Header>>,
}

// SAFETY: every Object is Send + Sync and the count is atomic.
unsafe impl Send for Ref {}
unsafe impl Sync for Ref {}

impl Ref {
    /// An empty reference.
    #[inline]
    pub const fn new() -> Self {
        Self { node: None }
    }

    /// A reference to a new object holding `value`.
    pub fn from_object<T: Object>(value: T) -> Self {
        RefT::new(value).into()
    }

    /// A reference to a new object holding `value`, stored in `pool`.
    pub fn from_object_in<T: Object>(value: T, pool: &Arc<Allocator>) -> Result<Self> {
        RefT::new_in(value, pool).map(Self::from)
    }

    /// Point at whatever `other` points at.
    ///
    /// On error (the new target's count would overflow) nothing changes.
    pub fn set(&mut self, other: &Ref) -> Result<()> {
        if let Some(node) = other.node {
            acquire(node)?;
        }
        if let Some(old) = core::mem::replace(&mut self.node, other.node) {
            release(old);
        }
        Ok(())
    }

    /// Point at a new object holding `value`.
    pub fn set_object<T: Object>(&mut self, value: T) {
        *self = Self::from_object(value);
    }

    /// Become empty, releasing the current target.
    #[inline]
    pub fn clear(&mut self) {
        if let Some(old) = self.node.take() {
            release(old);
        }
    }

    /// Move the target out, leaving this reference empty.
    #[inline]
    pub fn take(&mut self) -> Ref {
        core::mem::take(self)
    }

    /// The target, if any.
    #[inline]
    pub fn get(&self) -> Option<&dyn Object> {
        // SAFETY: the count we hold keeps the node alive.
        self.node.map(|node| unsafe { Header::as_object(node) })
    }

    /// The target, or [`Error::NullPointer`] when empty.
    #[inline]
    pub fn target(&self) -> Result<&dyn Object> {
        self.get().ok_or(Error::NullPointer("Ref"))
    }

    /// Whether this reference is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    /// Current reference count of the target.
    pub fn references(&self) -> Option<i32> {
        // SAFETY: the count we hold keeps the node alive.
        self.node
            .map(|node| unsafe { node.as_ref() }.refs.load(Ordering::Relaxed))
    }

    /// Whether both references point at the same object (or are both empty).
    #[inline]
    pub fn ptr_eq(a: &Ref, b: &Ref) -> bool {
        a.node == b.node
    }

    /// Compare the targets through [`Object::compare`].
    pub fn compare(&self, other: &Ref) -> Result<CmpOrdering> {
        self.target()?.compare(other.target()?)
    }

    /// A second reference to the same target.
    ///
    /// Fails with [`Error::NoStorage`] if the count would overflow.
    pub fn try_clone(&self) -> Result<Ref> {
        if let Some(node) = self.node {
            acquire(node)?;
        }
        Ok(Ref { node: self.node })
    }

    /// Destroy every unreferenced object queued so far.
    ///
    /// Waits for any collection pass already running. Never returns while
    /// other threads keep releasing objects faster than they are destroyed.
    /// Returns `false` immediately when called from an object's destructor.
    pub fn gc() -> bool {
        collector().gc()
    }

    /// Run one collection pass unless one is already running.
    pub fn collect() -> bool {
        collector().collect()
    }

    /// Number of objects currently referenced.
    pub fn object_count() -> usize {
        collector().stats().live
    }

    /// Collector counters.
    pub fn collector_stats() -> CollectorStats {
        collector().stats()
    }

    /// Log collector statistics at debug level.
    pub fn debug_static() {
        collector().debug();
    }
}

impl Default for Ref {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Ref {
    /// Aborts the process if the count would overflow.
    fn clone(&self) -> Self {
        if let Some(node) = self.node {
            acquire_or_abort(node);
        }
        Ref { node: self.node }
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        self.clear();
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        Ref::ptr_eq(self, other)
    }
}

impl Eq for Ref {}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => write!(f, "Ref({})", object.string()),
            None => f.write_str("Ref(null)"),
        }
    }
}

impl<T: Object> From<RefT<T>> for Ref {
    fn from(typed: RefT<T>) -> Self {
        let typed = ManuallyDrop::new(typed);
        Ref {
            node: typed.node.map(NonNull::cast),
        }
    }
}

impl<T: Object> From<&RefT<T>> for Ref {
    fn from(typed: &RefT<T>) -> Self {
        typed.clone().into()
    }
}

// ---------------------------------------------------------------------------
// RefT
// ---------------------------------------------------------------------------

/// A counted reference to a `T`, possibly empty.
///
/// Converts into a [`Ref`]; the reverse conversion does not exist.
pub struct RefT<T: Object> {
    node: Option<NonNull<Node<T>>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Object> Send for RefT<T> {}
unsafe impl<T: Object> Sync for RefT<T> {}

impl<T: Object> RefT<T> {
    /// Item size an [`Allocator`] needs to hold `T` objects.
    pub const NODE_SIZE: usize = Node::<T>::SIZE;

    /// An empty reference.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            node: None,
            _marker: PhantomData,
        }
    }

    fn adopt(node: NonNull<Node<T>>) -> Self {
        // A fresh node has count 0 and cannot overflow.
        acquire_or_abort(node.cast());
        Self {
            node: Some(node),
            _marker: PhantomData,
        }
    }

    /// A reference to a new object holding `value`.
    pub fn new(value: T) -> Self {
        Self::adopt(Node::boxed(value))
    }

    /// A reference to a new object holding `value`, stored in `pool`.
    ///
    /// Fails if `pool` items cannot hold a `T` or no storage is available.
    pub fn new_in(value: T, pool: &Arc<Allocator>) -> Result<Self> {
        Self::build_in(pool, move |_| value)
    }

    /// A reference to a new object stored in `pool`, built by `build` from
    /// the address the object will live at.
    pub fn build_in(pool: &Arc<Allocator>, build: impl FnOnce(usize) -> T) -> Result<Self> {
        Node::build_in(pool, build).map(Self::adopt)
    }

    /// The target, if any.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: the count we hold keeps the node alive.
        self.node.map(|node| unsafe { &(*node.as_ptr()).value })
    }

    /// The target, or [`Error::NullPointer`] when empty.
    #[inline]
    pub fn target(&self) -> Result<&T> {
        self.get().ok_or(Error::NullPointer("RefT"))
    }

    /// Whether this reference is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    /// Point at whatever `other` points at. On error nothing changes.
    pub fn set(&mut self, other: &RefT<T>) -> Result<()> {
        if let Some(node) = other.node {
            acquire(node.cast())?;
        }
        if let Some(old) = core::mem::replace(&mut self.node, other.node) {
            release(old.cast());
        }
        Ok(())
    }

    /// Point at a new object holding `value`.
    pub fn set_value(&mut self, value: T) {
        *self = Self::new(value);
    }

    /// Become empty, releasing the current target.
    #[inline]
    pub fn clear(&mut self) {
        if let Some(old) = self.node.take() {
            release(old.cast());
        }
    }

    /// Current reference count of the target.
    pub fn references(&self) -> Option<i32> {
        // SAFETY: the count we hold keeps the node alive.
        self.node
            .map(|node| unsafe { node.as_ref() }.header.refs.load(Ordering::Relaxed))
    }

    /// Whether both references point at the same object (or are both empty).
    #[inline]
    pub fn ptr_eq(a: &RefT<T>, b: &RefT<T>) -> bool {
        a.node == b.node
    }

    /// A second reference to the same target. Fails if the count would
    /// overflow.
    pub fn try_clone(&self) -> Result<Self> {
        if let Some(node) = self.node {
            acquire(node.cast())?;
        }
        Ok(Self {
            node: self.node,
            _marker: PhantomData,
        })
    }
}

impl<T: Object> Default for RefT<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Object> Clone for RefT<T> {
    /// Aborts the process if the count would overflow.
    fn clone(&self) -> Self {
        if let Some(node) = self.node {
            acquire_or_abort(node.cast());
        }
        Self {
            node: self.node,
            _marker: PhantomData,
        }
    }
}

impl<T: Object> Drop for RefT<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: Object> PartialEq for RefT<T> {
    fn eq(&self, other: &Self) -> bool {
        RefT::ptr_eq(self, other)
    }
}

impl<T: Object> Eq for RefT<T> {}

impl<T: Object> fmt::Debug for RefT<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => write!(f, "RefT({})", object.string()),
            None => f.write_str("RefT(null)"),
        }
    }
}
