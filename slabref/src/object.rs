//! The `Object` trait and the intrusive node every referenced object lives in.
//!
//! ```text
//! Node<T> (#[repr(C)])
//!   offset 0: Header { refs, reclaim, vtable }
//!             origin: Option<Arc<Allocator>>
//!             value:  T
//! ```
//!
//! The header is at offset 0 so the collector can walk a type-erased list of
//! `*mut Header` and still destroy each node through its vtable.

use crate::allocator::{Allocator, ITEM_ALIGN};
use crate::error::{Error, Result};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::any::Any;
use core::cmp::Ordering as CmpOrdering;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

/// Upcast to [`Any`] for every sized `'static` type.
pub trait AsAny {
    /// `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// Name of the concrete type.
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn type_name(&self) -> &'static str {
        core::any::type_name::<T>()
    }
}

/// Anything that can be held through a [`Ref`](crate::Ref).
///
/// Every method has a default based on the object's address, so an empty
/// `impl Object for MyType {}` is enough.
pub trait Object: AsAny + Send + Sync + 'static {
    /// Order `self` relative to `other`.
    ///
    /// Implementations comparing by content use [`compare_cast`] and fail
    /// with [`Error::CompareCast`] on an incompatible `other`.
    fn compare(&self, other: &dyn Object) -> Result<CmpOrdering> {
        Ok(address_of(self).cmp(&address_of(other)))
    }

    /// Hash code.
    fn hashf(&self) -> u64 {
        (address_of(self) >> 3) as u64
    }

    /// Human readable form.
    fn string(&self) -> String {
        format!("Object@{:#x}", address_of(self))
    }
}

#[inline]
fn address_of<T: ?Sized>(value: &T) -> usize {
    (value as *const T).cast::<()>() as usize
}

impl dyn Object {
    /// Whether the concrete type is `T`.
    #[inline]
    pub fn is<T: Object>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// The concrete `T`, if that is what this is.
    #[inline]
    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// `other` as a `T`, or [`Error::CompareCast`].
///
/// ```
/// use core::cmp::Ordering;
/// use slabref::{Object, Result, compare_cast};
///
/// struct Version(u32);
///
/// impl Object for Version {
///     fn compare(&self, other: &dyn Object) -> Result<Ordering> {
///         Ok(self.0.cmp(&compare_cast::<Version>(other)?.0))
///     }
/// }
///
/// assert_eq!(Version(1).compare(&Version(2)).unwrap(), Ordering::Less);
///
/// struct Label;
/// impl Object for Label {}
///
/// assert!(Version(1).compare(&Label).is_err());
/// ```
pub fn compare_cast<T: Object>(other: &dyn Object) -> Result<&T> {
    other.downcast_ref::<T>().ok_or_else(|| Error::CompareCast {
        left: core::any::type_name::<T>().to_owned(),
        right: other.type_name().to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Per-type operations on a type-erased node.
pub(crate) struct VTable {
    pub(crate) as_object: unsafe fn(NonNull<Header>) -> *const dyn Object,
    pub(crate) destroy: unsafe fn(NonNull<Header>),
}

/// Common prefix of every node.
#[repr(C)]
pub(crate) struct Header {
    /// Number of `Ref`s holding this node.
    pub(crate) refs: AtomicI32,
    /// Link in the collector's reclaim list.
    pub(crate) reclaim: AtomicPtr<Header>,
    pub(crate) vtable: &'static VTable,
}

impl Header {
    /// Take one reference.
    ///
    /// Fails, leaving the count unchanged, if it would exceed `i32::MAX`.
    /// Returns whether the object just became referenced.
    #[inline]
    pub(crate) fn acquire(&self) -> Result<bool> {
        let mut current = self.refs.load(Ordering::Relaxed);
        loop {
            if current == i32::MAX {
                return Err(Error::no_storage("reference count overflow"));
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current == 0),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference. Returns whether this was the last one.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        core::sync::atomic::fence(Ordering::Acquire);
        true
    }

    /// # Safety
    ///
    /// `header` must be live.
    #[inline]
    pub(crate) unsafe fn as_object<'a>(header: NonNull<Header>) -> &'a dyn Object {
        unsafe { &*(header.as_ref().vtable.as_object)(header) }
    }

    /// Destroy the node and release its storage.
    ///
    /// # Safety
    ///
    /// `header` must be unreferenced and must not be used again.
    #[inline]
    pub(crate) unsafe fn destroy(header: NonNull<Header>) {
        unsafe { (header.as_ref().vtable.destroy)(header) }
    }
}

/// Storage for one `T`.
#[repr(C)]
pub(crate) struct Node<T> {
    pub(crate) header: Header,
    origin: Option<Arc<Allocator>>,
    pub(crate) value: T,
}

struct VTableOf<T>(PhantomData<T>);

impl<T: Object> VTableOf<T> {
    const VTABLE: VTable = VTable {
        as_object: as_object::<T>,
        destroy: destroy::<T>,
    };
}

unsafe fn as_object<T: Object>(header: NonNull<Header>) -> *const dyn Object {
    let node = header.cast::<Node<T>>().as_ptr();
    unsafe { &raw const (*node).value as *const T as *const dyn Object }
}

/// Returns node storage to wherever it came from, even while `T::drop` unwinds.
struct Storage<T> {
    node: NonNull<Node<T>>,
    origin: Option<Arc<Allocator>>,
}

impl<T> Drop for Storage<T> {
    fn drop(&mut self) {
        match self.origin.take() {
            // SAFETY: the node was obtained from this allocator.
            Some(pool) => unsafe { pool.put(self.node.cast()) },
            // SAFETY: the node was boxed with this layout.
            None => unsafe {
                alloc::alloc::dealloc(self.node.as_ptr().cast(), Layout::new::<Node<T>>())
            },
        }
    }
}

unsafe fn destroy<T: Object>(header: NonNull<Header>) {
    let node = header.cast::<Node<T>>();
    unsafe {
        let origin = ptr::read(&raw const (*node.as_ptr()).origin);
        let _storage = Storage { node, origin };
        ptr::drop_in_place(&raw mut (*node.as_ptr()).value);
    }
}

impl<T: Object> Node<T> {
    fn new(origin: Option<Arc<Allocator>>, value: T) -> Self {
        Node {
            header: Header {
                refs: AtomicI32::new(0),
                reclaim: AtomicPtr::new(ptr::null_mut()),
                vtable: &VTableOf::<T>::VTABLE,
            },
            origin,
            value,
        }
    }

    /// Bytes an allocator item must hold to store a `T`.
    pub(crate) const SIZE: usize = core::mem::size_of::<Node<T>>();

    /// A fresh, unreferenced node on the global heap.
    pub(crate) fn boxed(value: T) -> NonNull<Node<T>> {
        let node = Box::new(Self::new(None, value));
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// A fresh, unreferenced node in `pool`, built by `build` from the final
    /// address of the value.
    pub(crate) fn build_in(
        pool: &Arc<Allocator>,
        build: impl FnOnce(usize) -> T,
    ) -> Result<NonNull<Node<T>>> {
        if Self::SIZE > pool.item_size() {
            return Err(Error::no_storage(format!(
                "{} needs {} bytes, allocator items hold {}",
                core::any::type_name::<T>(),
                Self::SIZE,
                pool.item_size()
            )));
        }
        if core::mem::align_of::<Node<T>>() > ITEM_ALIGN {
            return Err(Error::no_storage(format!(
                "{} needs alignment {}, allocator guarantees {ITEM_ALIGN}",
                core::any::type_name::<T>(),
                core::mem::align_of::<Node<T>>()
            )));
        }

        let node = pool.get()?.cast::<Node<T>>();
        let storage = Storage {
            node,
            origin: Some(pool.clone()),
        };
        let value = build(unsafe { &raw const (*node.as_ptr()).value } as usize);
        let origin = ManuallyDrop::new(storage).origin.take();
        // SAFETY: the item is large and aligned enough for a Node<T>.
        unsafe { node.as_ptr().write(Self::new(origin, value)) };
        Ok(node)
    }
}
