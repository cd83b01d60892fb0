//! Process-wide source of aligned extension pages.
//!
//! Pages from 4 KiB up to half a bulk are carved out of large bulk
//! allocations and kept on per-size free lists, so a page one [`Allocator`]
//! releases is reused by any other. Bulk storage is never given back.
//! Sizes outside that range go straight to the global allocator.
//!
//! ```text
//! PagePool ── master (SharedLatch)
//!   ├─ best[class] → first bulk able to serve `class`
//!   └─ bulks: Bulk ── lists (Latch) [4K] [8K] … [32M]
//! ```
//!
//! A page of class `c` is `4 KiB << c` bytes and aligned to its size. When a
//! class runs dry, one larger page is split in halves down to the request.
//!
//! [`Allocator`]: crate::Allocator

use crate::config;
use crate::error::{Error, Result};
use crate::latch::{RawLatch, SharedLatch};
use crate::latched::Latched;
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use once_cell::race::OnceBox;
use serde::Serialize;
use tracing::{debug, error, info};

const LOG_SIZE_ZERO: u32 = 12;
/// Smallest pooled page.
pub(crate) const SIZE_ZERO: usize = 1 << LOG_SIZE_ZERO;
/// Number of pooled size classes.
const SIZE_COUNT: usize = 14;
/// Length of one bulk allocation.
const BULK_SIZE: usize = SIZE_ZERO << SIZE_COUNT;

#[inline]
const fn class_size(class: usize) -> usize {
    SIZE_ZERO << class
}

/// Counters kept by the page pool, see
/// [`Allocator::page_pool_stats`](crate::Allocator::page_pool_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PagePoolStats {
    /// Bulk allocations made.
    pub bulks: usize,
    /// Pages handed out.
    pub finds: usize,
    /// Pages taken back.
    pub frees: usize,
    /// Pages served directly by the global allocator.
    pub system: usize,
    /// Bytes sitting on free lists.
    pub available: usize,
}

/// Link overlaid on a cached page.
#[repr(C)]
struct FreePage {
    next: *mut FreePage,
}

#[derive(Clone, Copy)]
struct FreeList {
    head: *mut FreePage,
    count: usize,
}

// SAFETY: cached pages belong to the pool and are only touched under the
// owning bulk's latch.
unsafe impl Send for FreeList {}

impl FreeList {
    const EMPTY: Self = Self {
        head: ptr::null_mut(),
        count: 0,
    };

    /// # Safety
    ///
    /// `page` must be unused pool storage of this list's size class.
    unsafe fn push(&mut self, page: NonNull<u8>) {
        let page = page.as_ptr().cast::<FreePage>();
        unsafe { (*page).next = self.head };
        self.head = page;
        self.count += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let page = NonNull::new(self.head)?;
        // SAFETY: every listed page carries a link.
        self.head = unsafe { page.as_ref().next };
        self.count -= 1;
        Some(page.cast())
    }
}

type Lists = [FreeList; SIZE_COUNT];

/// Split a page larger than `class` and return a `class` piece.
///
/// The lower pieces (one per class from `bigger - 1` down to `class`) go
/// back on their lists.
fn split(lists: &mut Lists, class: usize) -> Option<NonNull<u8>> {
    let bigger = (class + 1..SIZE_COUNT).find(|&c| lists[c].count > 0)?;
    let mut piece = lists[bigger].pop()?;
    for smaller in (class..bigger).rev() {
        // SAFETY: each piece is a disjoint, size-aligned part of the split page.
        unsafe {
            lists[smaller].push(piece);
            piece = piece.add(class_size(smaller));
        }
    }
    Some(piece)
}

/// One bulk allocation and the free pages carved from it.
struct Bulk {
    storage: NonNull<u8>,
    lists: Latched<Lists>,
}

// SAFETY: `storage` is only used for range checks and the final release;
// the pages inside are reached under `lists`.
unsafe impl Send for Bulk {}
unsafe impl Sync for Bulk {}

impl Bulk {
    fn layout() -> Layout {
        // SAFETY: nonzero power-of-two alignment no larger than the size.
        unsafe { Layout::from_size_align_unchecked(BULK_SIZE, SIZE_ZERO) }
    }

    /// Allocate and carve a bulk.
    ///
    /// Small pages are cut from the front until the cursor reaches the
    /// largest class alignment, then the rest is cut largest first.
    fn new() -> Result<Self> {
        // SAFETY: nonzero size.
        let storage = NonNull::new(unsafe { std::alloc::alloc(Self::layout()) })
            .ok_or_else(|| Error::no_storage(format!("bulk allocation of {BULK_SIZE:#x} bytes")))?;

        let base = storage.as_ptr().addr();
        let mut lists = [FreeList::EMPTY; SIZE_COUNT];
        let mut offset = 0;

        for (class, next) in [(0, 4), (4, 8), (8, 12), (12, 13)] {
            while (base + offset) & (class_size(next) - 1) != 0 {
                // SAFETY: offset stays within the bulk.
                unsafe { lists[class].push(storage.add(offset)) };
                offset += class_size(class);
            }
        }
        for class in [13, 12, 8, 4, 0] {
            while offset + class_size(class) <= BULK_SIZE {
                unsafe { lists[class].push(storage.add(offset)) };
                offset += class_size(class);
            }
        }

        Ok(Self {
            storage,
            lists: Latched::new(lists),
        })
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        let origin = self.storage.as_ptr().addr();
        addr >= origin && addr < origin + BULK_SIZE
    }
}

impl Drop for Bulk {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { std::alloc::dealloc(self.storage.as_ptr(), Self::layout()) };
    }
}

struct Directory {
    bulks: Vec<Bulk>,
    /// Per class, the first bulk holding a page of that class or larger.
    best: [Option<usize>; SIZE_COUNT],
}

impl Directory {
    fn reset_best(&mut self) {
        self.best = [None; SIZE_COUNT];
        for (index, bulk) in self.bulks.iter().enumerate() {
            let lists = bulk.lists.lock();
            let mut largest = None;
            for class in (0..SIZE_COUNT).rev() {
                if lists[class].count > 0 {
                    largest = Some(class);
                    break;
                }
            }
            if let Some(largest) = largest {
                for slot in &mut self.best[..=largest] {
                    if slot.is_none() {
                        *slot = Some(index);
                    }
                }
            }
        }
    }
}

/// Shared page source behind every [`Allocator`](crate::Allocator).
pub(crate) struct PagePool {
    /// Shared to look up or release pages, exclusive to grow or re-index.
    master: SharedLatch,
    directory: UnsafeCell<Directory>,
    /// Read once, so pages always go back where they came from.
    pooled: bool,

    bulks: AtomicUsize,
    finds: AtomicUsize,
    frees: AtomicUsize,
    system: AtomicUsize,
}

// SAFETY: the directory is read under the shared master latch and written
// only under the exclusive one.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

static POOL: OnceBox<PagePool> = OnceBox::new();

/// The process-wide pool.
#[inline]
pub(crate) fn pool() -> &'static PagePool {
    POOL.get_or_init(|| Box::new(PagePool::new(config::get().allocator.page_pool)))
}

impl PagePool {
    fn new(pooled: bool) -> Self {
        Self {
            master: SharedLatch::new(),
            directory: UnsafeCell::new(Directory {
                bulks: Vec::new(),
                best: [None; SIZE_COUNT],
            }),
            pooled,
            bulks: AtomicUsize::new(0),
            finds: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            system: AtomicUsize::new(0),
        }
    }

    /// Size class serving `size`, or `None` for the global allocator.
    #[inline]
    fn class_of(&self, size: usize) -> Option<usize> {
        (self.pooled && size.is_power_of_two() && (SIZE_ZERO..=BULK_SIZE / 2).contains(&size))
            .then(|| (size >> LOG_SIZE_ZERO).trailing_zeros() as usize)
    }

    /// Obtain an uninitialized page of `size` bytes aligned to `size`.
    pub(crate) fn find_page(&self, size: usize) -> Result<NonNull<u8>> {
        self.finds.fetch_add(1, Ordering::Relaxed);
        let Some(class) = self.class_of(size) else {
            return self.system_alloc(size);
        };

        loop {
            {
                let _share = self.master.guard();
                // SAFETY: shared master latch held.
                let directory = unsafe { &*self.directory.get() };
                if let Some(index) = directory.best[class] {
                    if let Some(page) = directory.bulks[index].lists.lock()[class].pop() {
                        return Ok(page);
                    }
                }
            }

            let exclusive = self.master.exclusive();
            let _master = exclusive.guard();
            // SAFETY: exclusive master latch held.
            let directory = unsafe { &mut *self.directory.get() };
            if let Some(index) = directory.best[class] {
                let mut lists = directory.bulks[index].lists.lock();
                if let Some(page) = lists[class].pop().or_else(|| split(&mut lists, class)) {
                    return Ok(page);
                }
            }

            directory.reset_best();
            if directory.best[class].is_none() {
                directory.bulks.push(Bulk::new()?);
                let bulks = self.bulks.fetch_add(1, Ordering::Relaxed) + 1;
                info!(bulks, size = BULK_SIZE, "page pool grew");
                directory.reset_best();
            }
        }
    }

    /// Take back a page obtained from [`find_page`](Self::find_page).
    ///
    /// # Safety
    ///
    /// `page` must come from `find_page(size)` and must not be used afterwards.
    pub(crate) unsafe fn free_page(&self, page: NonNull<u8>, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        let Some(class) = self.class_of(size) else {
            // SAFETY: `find_page` used the same layout.
            unsafe { std::alloc::dealloc(page.as_ptr(), Self::system_layout(size)) };
            return;
        };

        {
            let _share = self.master.guard();
            // SAFETY: shared master latch held.
            let directory = unsafe { &*self.directory.get() };
            let addr = page.as_ptr().addr();
            if let Some(bulk) = directory.bulks.iter().find(|bulk| bulk.contains(addr)) {
                // SAFETY: the caller returns a pool page of this class.
                unsafe { bulk.lists.lock()[class].push(page) };
                return;
            }
        }

        self.debug();
        error!(page = ?page, size, "page returned to the pool was never handed out");
        std::process::abort();
    }

    fn system_layout(size: usize) -> Layout {
        // SAFETY: only called with sizes `system_alloc` accepted.
        unsafe { Layout::from_size_align_unchecked(size, size) }
    }

    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, size)
            .map_err(|_| Error::no_storage(format!("invalid page size {size:#x}")))?;
        self.system.fetch_add(1, Ordering::Relaxed);
        // SAFETY: layout has nonzero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
            .ok_or_else(|| Error::no_storage(format!("page allocation of {size:#x} bytes failed")))
    }

    pub(crate) fn stats(&self) -> PagePoolStats {
        let available = {
            let _share = self.master.guard();
            // SAFETY: shared master latch held.
            let directory = unsafe { &*self.directory.get() };
            directory
                .bulks
                .iter()
                .map(|bulk| {
                    let lists = bulk.lists.lock();
                    (0..SIZE_COUNT)
                        .map(|class| lists[class].count * class_size(class))
                        .sum::<usize>()
                })
                .sum()
        };
        PagePoolStats {
            bulks: self.bulks.load(Ordering::Relaxed),
            finds: self.finds.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            system: self.system.load(Ordering::Relaxed),
            available,
        }
    }

    /// Log the pool state at debug level.
    pub(crate) fn debug(&self) {
        debug!(pooled = self.pooled, stats = ?self.stats(), "page pool");

        let _share = self.master.guard();
        // SAFETY: shared master latch held.
        let directory = unsafe { &*self.directory.get() };
        debug!(best = ?directory.best, "page pool classes");
        for bulk in &directory.bulks {
            let lists = bulk.lists.lock();
            let mut available = 0;
            for (class, list) in lists.iter().enumerate() {
                if list.count > 0 {
                    available += list.count * class_size(class);
                    debug!(
                        bulk = ?bulk.storage,
                        class,
                        size = class_size(class),
                        count = list.count,
                        "..free pages"
                    );
                }
            }
            debug!(
                bulk = ?bulk.storage,
                available,
                used = BULK_SIZE - available,
                "..bulk"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn free_bytes(pool: &PagePool) -> usize {
        pool.stats().available
    }

    #[test]
    fn carving_covers_the_whole_bulk() {
        let pool = PagePool::new(true);
        let page = pool.find_page(SIZE_ZERO).unwrap();
        assert_eq!(pool.stats().bulks, 1);
        assert_eq!(free_bytes(&pool) + SIZE_ZERO, BULK_SIZE);
        unsafe { pool.free_page(page, SIZE_ZERO) };
        assert_eq!(free_bytes(&pool), BULK_SIZE);
    }

    #[test]
    fn every_class_is_size_aligned() {
        let pool = PagePool::new(true);
        let mut pages = Vec::new();
        for class in 0..SIZE_COUNT {
            let size = class_size(class);
            let page = pool.find_page(size).unwrap();
            assert_eq!(page.as_ptr().addr() % size, 0, "class {class}");
            pages.push((page, size));
        }
        for (page, size) in pages {
            unsafe { pool.free_page(page, size) };
        }
    }

    #[test]
    fn split_leaves_one_piece_per_smaller_class() {
        let mut lists = [FreeList::EMPTY; SIZE_COUNT];
        let layout = Layout::from_size_align(class_size(3), class_size(3)).unwrap();
        let storage = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
        unsafe { lists[3].push(storage) };

        let piece = split(&mut lists, 0).unwrap();
        assert_eq!(lists[3].count, 0);
        assert_eq!((lists[0].count, lists[1].count, lists[2].count), (1, 1, 1));
        assert_eq!(lists[2].pop(), Some(storage));
        let offset = piece.as_ptr().addr() - storage.as_ptr().addr();
        assert_eq!(offset, class_size(3) - class_size(0));

        unsafe { std::alloc::dealloc(storage.as_ptr(), layout) };
    }

    #[test]
    fn released_pages_are_reused() {
        let pool = PagePool::new(true);
        let first = pool.find_page(2 * SIZE_ZERO).unwrap();
        unsafe { pool.free_page(first, 2 * SIZE_ZERO) };
        let again = pool.find_page(2 * SIZE_ZERO).unwrap();
        assert_eq!(first, again);
        unsafe { pool.free_page(again, 2 * SIZE_ZERO) };
    }

    #[test]
    fn odd_sizes_bypass_the_pool() {
        let pool = PagePool::new(true);
        let big = pool.find_page(BULK_SIZE).unwrap();
        assert_eq!(pool.stats().system, 1);
        assert_eq!(pool.stats().bulks, 0);
        unsafe { pool.free_page(big, BULK_SIZE) };

        let unpooled = PagePool::new(false);
        let page = unpooled.find_page(SIZE_ZERO).unwrap();
        assert_eq!(page.as_ptr().addr() % SIZE_ZERO, 0);
        assert_eq!(unpooled.stats().system, 1);
        unsafe { unpooled.free_page(page, SIZE_ZERO) };
    }

    #[test]
    fn concurrent_finds_are_distinct() {
        let pool = Arc::new(PagePool::new(true));
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let size = class_size(n % 3);
                    (0..200)
                        .map(|_| {
                            let page = pool.find_page(size).unwrap();
                            (page.as_ptr().expose_provenance(), size)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let pages: Vec<_> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let starts: HashSet<_> = pages.iter().map(|&(addr, _)| addr).collect();
        assert_eq!(starts.len(), pages.len());

        for (addr, size) in pages {
            let page = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(addr)).unwrap();
            unsafe { pool.free_page(page, size) };
        }
        pool.debug();
    }
}
