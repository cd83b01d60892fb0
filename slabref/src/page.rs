//! Extension pages: aligned chunks carved into fixed-size items.
//!
//! A [`Page`] header sits at offset 0 of every page, so the owning page of an
//! item is found by masking the item address with the page mask. Items are
//! handed out first by bumping `offset` through never-used space, then from
//! the page's private free list.

use crate::error::Result;
use crate::page_pool::{self, SIZE_ZERO};
use core::ptr::{self, NonNull};

/// Link overlaid on a free item.
#[repr(C)]
pub(crate) struct Item {
    pub(crate) next: *mut Item,
}

/// Header at the start of every extension page.
#[repr(C)]
pub(crate) struct Page {
    pub(crate) prev: *mut Page,
    pub(crate) next: *mut Page,
    /// Private free list.
    pub(crate) head: *mut Item,
    /// Byte offset of the first never-used item.
    pub(crate) offset: usize,
    /// Items available: free-list length plus never-used items.
    pub(crate) avails: usize,
}

/// Space reserved for the header; keeps items 16-byte aligned within a page.
pub(crate) const PAGE_PREFIX: usize = round_up(core::mem::size_of::<Page>(), 16);

/// Smallest extension page.
pub(crate) const MIN_PAGE_SIZE: usize = SIZE_ZERO;

#[inline]
pub(crate) const fn round_up(size: usize, align: usize) -> usize {
    (size + (align - 1)) & !(align - 1)
}

/// Obtain an uninitialized page of `size` bytes aligned to `size`.
pub(crate) fn alloc_page(size: usize) -> Result<NonNull<Page>> {
    page_pool::pool().find_page(size).map(NonNull::cast)
}

/// Return a page obtained from [`alloc_page`] with the same `size`.
///
/// # Safety
///
/// `page` must come from `alloc_page(size)` and must not be used afterwards.
pub(crate) unsafe fn free_page(page: NonNull<Page>, size: usize) {
    unsafe { page_pool::pool().free_page(page.cast(), size) };
}

impl Page {
    /// Write a fresh header holding `capacity` never-used items.
    ///
    /// # Safety
    ///
    /// `page` must point to writable page storage.
    pub(crate) unsafe fn init(page: NonNull<Page>, capacity: usize) {
        unsafe {
            page.as_ptr().write(Page {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                head: ptr::null_mut(),
                offset: PAGE_PREFIX,
                avails: capacity,
            });
        }
    }
}

/// Doubly linked list of extension pages. Must be accessed under the page latch.
pub(crate) struct PageList {
    pub(crate) head: *mut Page,
    pub(crate) tail: *mut Page,
    /// Linked pages with every item available.
    pub(crate) idle: usize,
}

// SAFETY: the raw page pointers are owned by the allocator and only touched
// while holding its page latch.
unsafe impl Send for PageList {}

impl PageList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            idle: 0,
        }
    }

    /// Link a fresh page, all of whose items are available, at the head.
    ///
    /// # Safety
    ///
    /// `page` must be live, initialized and not currently linked.
    pub(crate) unsafe fn adopt(&mut self, page: NonNull<Page>) {
        unsafe { self.push_head(page) };
        self.idle += 1;
    }

    /// Account for one item handed out of `page`.
    ///
    /// A page left with nothing available moves to the tail.
    ///
    /// # Safety
    ///
    /// `page` must be linked here with `avails > 0`, out of `capacity` items.
    pub(crate) unsafe fn item_taken(&mut self, page: NonNull<Page>, capacity: usize) {
        let p = page.as_ptr();
        unsafe {
            if (*p).avails == capacity {
                self.idle -= 1;
            }
            (*p).avails -= 1;
            if (*p).avails == 0 {
                self.move_to_tail(page);
            }
        }
    }

    /// Account for one item given back to `page`.
    ///
    /// Returns `true` when the page became idle while `keep` idle pages are
    /// already linked. The page is then unlinked and belongs to the caller.
    /// Otherwise it moves to the head.
    ///
    /// # Safety
    ///
    /// `page` must be linked here with `avails < capacity`.
    pub(crate) unsafe fn item_returned(
        &mut self,
        page: NonNull<Page>,
        capacity: usize,
        keep: usize,
    ) -> bool {
        let p = page.as_ptr();
        unsafe {
            (*p).avails += 1;
            if (*p).avails == capacity {
                if self.idle >= keep {
                    self.remove(page);
                    return true;
                }
                self.idle += 1;
            }
            self.move_to_head(page);
        }
        false
    }

    /// First of the leading `limit` pages with an available item.
    pub(crate) fn find_available(&self, limit: usize) -> Option<NonNull<Page>> {
        let mut next = self.head;
        for _ in 0..limit {
            let page = NonNull::new(next)?;
            // SAFETY: linked pages are live.
            unsafe {
                if (*next).avails > 0 {
                    return Some(page);
                }
                next = (*next).next;
            }
        }
        None
    }

    /// Link `page` at the head.
    ///
    /// # Safety
    ///
    /// `page` must be live and not currently linked.
    pub(crate) unsafe fn push_head(&mut self, page: NonNull<Page>) {
        let page = page.as_ptr();
        unsafe {
            (*page).prev = ptr::null_mut();
            (*page).next = self.head;
            if self.head.is_null() {
                self.tail = page;
            } else {
                (*self.head).prev = page;
            }
        }
        self.head = page;
    }

    /// Link `page` at the tail.
    ///
    /// # Safety
    ///
    /// `page` must be live and not currently linked.
    pub(crate) unsafe fn push_tail(&mut self, page: NonNull<Page>) {
        let page = page.as_ptr();
        unsafe {
            (*page).next = ptr::null_mut();
            (*page).prev = self.tail;
            if self.tail.is_null() {
                self.head = page;
            } else {
                (*self.tail).next = page;
            }
        }
        self.tail = page;
    }

    /// Unlink `page`.
    ///
    /// # Safety
    ///
    /// `page` must be live and currently linked into this list.
    pub(crate) unsafe fn remove(&mut self, page: NonNull<Page>) {
        let page = page.as_ptr();
        unsafe {
            let (prev, next) = ((*page).prev, (*page).next);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*page).prev = ptr::null_mut();
            (*page).next = ptr::null_mut();
        }
    }

    /// Move a linked `page` to the head.
    ///
    /// # Safety
    ///
    /// `page` must be live and currently linked into this list.
    pub(crate) unsafe fn move_to_head(&mut self, page: NonNull<Page>) {
        if self.head != page.as_ptr() {
            unsafe {
                self.remove(page);
                self.push_head(page);
            }
        }
    }

    /// Move a linked `page` to the tail.
    ///
    /// # Safety
    ///
    /// `page` must be live and currently linked into this list.
    pub(crate) unsafe fn move_to_tail(&mut self, page: NonNull<Page>) {
        if self.tail != page.as_ptr() {
            unsafe {
                self.remove(page);
                self.push_tail(page);
            }
        }
    }
}
