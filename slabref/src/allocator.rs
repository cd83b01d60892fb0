//! Fixed-size slab allocator.
//!
//! Three tiers, tried in order by [`Allocator::get`]:
//!
//! 1. a small lock-free item cache (`ITEM_CACHE` slots, scanned from 0);
//! 2. the reserved pool: one contiguous region pre-sliced into items, with an
//!    atomic free-list head;
//! 3. extension pages: aligned chunks obtained on demand, each with a private
//!    free list, linked under the page latch.
//!
//! ```text
//! Allocator
//!   ├─→ itemCache [p0, p1, ∅, p3, ...]            CAS, no latch
//!   ├─→ itemHead  → i9 → i4 → i7                   CAS push, pops under itemLatch
//!   └─→ pageHead  ⇄ Page(avails 3) ⇄ Page(0) ⇄ …   pageLatch
//! ```
//!
//! Reserved items only ever return to the cache or `itemHead`; page items
//! only ever return to their own page. The owning page of an address is
//! `addr & page_mask`.

use crate::config::{self, AllocatorConfig};
use crate::error::{Error, Result};
use crate::latch::{Latch, RawLatch};
use crate::latched::Latched;
use crate::page::{self, Item, MIN_PAGE_SIZE, PAGE_PREFIX, Page, PageList, round_up};
use crate::page_pool::{self, PagePoolStats};
use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Number of lock-free item cache slots.
pub const ITEM_CACHE: usize = 8;

/// Alignment guaranteed for every address returned by [`Allocator::get`].
pub const ITEM_ALIGN: usize = 8;

/// Largest item, reserved region or page the allocator will build.
const IMPLEMENTATION_LIMIT: usize = 0x8000_0000;

/// Alignment of the reserved region.
const REGION_ALIGN: usize = 16;

/// Counters kept by an [`Allocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// `get()` calls.
    pub gets: usize,
    /// `put()` calls.
    pub puts: usize,
    /// Extension pages obtained.
    pub finds: usize,
    /// Extension pages released.
    pub frees: usize,
}

#[derive(Default)]
struct Counters {
    gets: AtomicUsize,
    puts: AtomicUsize,
    finds: AtomicUsize,
    frees: AtomicUsize,
}

#[inline]
fn statistic(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Fixed-size item allocator.
///
/// Callers only see opaque storage addresses; page and item bookkeeping is
/// internal.
pub struct Allocator {
    stats: Counters,

    item_cache: [CachePadded<AtomicPtr<Item>>; ITEM_CACHE],
    /// Serializes reserved-pool pops (pushes stay lock-free).
    item_latch: Latch,
    item_head: AtomicPtr<Item>,
    item_origin: *mut u8,
    item_ending: *mut u8,
    reserved: usize,

    pages: Latched<PageList>,
    used_pages: AtomicUsize,

    item_size: usize,
    page_size: usize,
    page_mask: usize,
    page_items: usize,
    page_cache: usize,
}

// SAFETY: the raw region pointers are immutable after construction, the free
// lists are reached only through atomics or under a latch.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Create an allocator of `item_size` byte items with `reserved`
    /// pre-allocated items and `extended` items per extension page.
    ///
    /// Sizing minimums come from the installed [`AllocatorConfig`].
    pub fn new(item_size: usize, reserved: usize, extended: usize) -> Result<Self> {
        Self::with_config(item_size, reserved, extended, &config::get().allocator)
    }

    /// Like [`Allocator::new`] with an explicit configuration.
    pub fn with_config(
        item_size: usize,
        reserved: usize,
        extended: usize,
        config: &AllocatorConfig,
    ) -> Result<Self> {
        if item_size > IMPLEMENTATION_LIMIT {
            return Err(Error::no_storage("item size exceeds implementation limit"));
        }
        let item_size = round_up(item_size.max(size_of::<Item>()), ITEM_ALIGN);
        let page_items = extended.max(config.min_extended).max(1);

        let needed = page_items
            .checked_mul(item_size)
            .and_then(|n| n.checked_add(PAGE_PREFIX))
            .filter(|&n| n <= IMPLEMENTATION_LIMIT)
            .ok_or_else(|| Error::no_storage("page size exceeds implementation limit"))?;
        let page_size = needed.next_power_of_two().max(MIN_PAGE_SIZE);

        let reserved = match reserved {
            0 => 0,
            n => n.max(config.min_reserved),
        };

        let mut this = Self {
            stats: Counters::default(),
            item_cache: core::array::from_fn(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut()))),
            item_latch: Latch::new(),
            item_head: AtomicPtr::new(ptr::null_mut()),
            item_origin: ptr::null_mut(),
            item_ending: ptr::null_mut(),
            reserved,
            pages: Latched::new(PageList::new()),
            used_pages: AtomicUsize::new(0),
            item_size,
            page_size,
            page_mask: !(page_size - 1),
            page_items,
            page_cache: config.page_cache.max(1),
        };
        this.reserve()?;

        debug!(
            item_size,
            reserved,
            page_size,
            page_items,
            "allocator constructed"
        );
        Ok(this)
    }

    /// Allocate and slice the reserved region.
    fn reserve(&mut self) -> Result<()> {
        if self.reserved == 0 {
            return Ok(());
        }
        let layout = self.region_layout()?;
        // SAFETY: nonzero size.
        let origin = unsafe { std::alloc::alloc(layout) };
        if origin.is_null() {
            return Err(Error::no_storage(format!(
                "reserved region of {:#x} bytes",
                layout.size()
            )));
        }
        self.item_origin = origin;
        // SAFETY: one past the end of the same allocation.
        self.item_ending = unsafe { origin.add(layout.size()) };

        for index in 0..self.reserved {
            // SAFETY: index < reserved keeps the item inside the region.
            let item = unsafe { origin.add(index * self.item_size) }.cast::<Item>();
            if index < ITEM_CACHE {
                self.item_cache[index].store(item, Ordering::Relaxed);
            } else {
                unsafe { (*item).next = self.item_head.load(Ordering::Relaxed) };
                self.item_head.store(item, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn region_layout(&self) -> Result<Layout> {
        self.reserved
            .checked_mul(self.item_size)
            .filter(|&n| n <= IMPLEMENTATION_LIMIT)
            .and_then(|n| Layout::from_size_align(n, REGION_ALIGN).ok())
            .ok_or_else(|| Error::no_storage("reserved region exceeds implementation limit"))
    }

    // ---- Allocation ----

    /// Allocate one item.
    ///
    /// Fails only when the OS cannot supply a new extension page.
    pub fn get(&self) -> Result<NonNull<u8>> {
        statistic(&self.stats.gets);

        // Lock-free fast path
        for slot in &self.item_cache {
            let item = slot.load(Ordering::Acquire);
            if !item.is_null()
                && slot
                    .compare_exchange(item, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                // SAFETY: item is non-null.
                return Ok(unsafe { NonNull::new_unchecked(item.cast()) });
            }
        }

        if let Some(item) = self.pop_reserved() {
            return Ok(item);
        }

        self.get_extended()
    }

    fn pop_reserved(&self) -> Option<NonNull<u8>> {
        if self.item_head.load(Ordering::Relaxed).is_null() {
            return None;
        }

        // Pops are single threaded: a popped item cannot reappear at the
        // head while another pop still holds it as `item`.
        let _guard = self.item_latch.guard();
        let mut item = self.item_head.load(Ordering::Acquire);
        while !item.is_null() {
            // SAFETY: item is on the free list and lies inside the region.
            let next = unsafe { (*item).next };
            match self
                .item_head
                .compare_exchange_weak(item, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return NonNull::new(item.cast()),
                Err(current) => item = current,
            }
        }
        None
    }

    fn get_extended(&self) -> Result<NonNull<u8>> {
        let mut pages = self.pages.lock();
        let page = match pages.find_available(self.page_cache) {
            Some(page) => page,
            None => self.new_page(&mut pages)?,
        };
        // SAFETY: page is linked and has avails > 0; we hold the page latch.
        Ok(unsafe { self.take_item(&mut pages, page) })
    }

    /// Pop an item from `page`; a drained page moves to the tail.
    unsafe fn take_item(&self, pages: &mut PageList, page: NonNull<Page>) -> NonNull<u8> {
        let p = page.as_ptr();
        unsafe {
            let item = if (*p).head.is_null() {
                let item = p.cast::<u8>().add((*p).offset);
                (*p).offset += self.item_size;
                item
            } else {
                let item = (*p).head;
                (*p).head = (*item).next;
                item.cast::<u8>()
            };
            pages.item_taken(page, self.page_items);
            NonNull::new_unchecked(item)
        }
    }

    fn new_page(&self, pages: &mut PageList) -> Result<NonNull<Page>> {
        let page = page::alloc_page(self.page_size)?;
        // SAFETY: fresh page storage, not yet linked.
        unsafe {
            Page::init(page, self.page_items);
            pages.adopt(page);
        }
        self.used_pages.fetch_add(1, Ordering::Relaxed);
        statistic(&self.stats.finds);
        trace!(page = ?page, used = self.get_used_pages(), "extension page obtained");
        Ok(page)
    }

    // ---- Release ----

    /// Return an item to the allocator.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by [`get`](Self::get) on this allocator
    /// and must not have been returned since.
    pub unsafe fn put(&self, addr: NonNull<u8>) {
        statistic(&self.stats.puts);
        let item = addr.as_ptr().cast::<Item>();

        if self.is_reserved(addr.as_ptr()) {
            for slot in &self.item_cache {
                if slot.load(Ordering::Relaxed).is_null()
                    && slot
                        .compare_exchange(ptr::null_mut(), item, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    return;
                }
            }

            let backoff = crossbeam_utils::Backoff::new();
            let mut head = self.item_head.load(Ordering::Relaxed);
            loop {
                // SAFETY: the caller hands the item back to us.
                unsafe { (*item).next = head };
                match self
                    .item_head
                    .compare_exchange_weak(head, item, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => return,
                    Err(current) => {
                        head = current;
                        backoff.spin();
                    }
                }
            }
        }

        let page = self.page_of(item);
        let mut pages = self.pages.lock();
        // SAFETY: a non-reserved item from this allocator lives in a linked page.
        unsafe {
            let p = page.as_ptr();
            (*item).next = (*p).head;
            (*p).head = item;
            if pages.item_returned(page, self.page_items, self.page_cache) {
                self.release_page(page);
            }
        }
    }

    /// Give an unlinked page back to the OS.
    unsafe fn release_page(&self, page: NonNull<Page>) {
        unsafe { page::free_page(page, self.page_size) };
        self.used_pages.fetch_sub(1, Ordering::Relaxed);
        statistic(&self.stats.frees);
        trace!(page = ?page, used = self.get_used_pages(), "extension page released");
    }

    #[inline]
    fn is_reserved(&self, addr: *const u8) -> bool {
        addr >= self.item_origin.cast_const() && addr < self.item_ending.cast_const()
    }

    #[inline]
    fn page_of(&self, item: *mut Item) -> NonNull<Page> {
        let page = item.map_addr(|addr| addr & self.page_mask).cast::<Page>();
        // SAFETY: an item inside a page never masks to address zero.
        unsafe { NonNull::new_unchecked(page) }
    }

    // ---- Accessors ----

    /// Extension pages currently linked.
    #[inline]
    pub fn get_used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    /// Size of every item, after rounding.
    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Size (and alignment) of an extension page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Items held by one extension page.
    #[inline]
    pub fn page_capacity(&self) -> usize {
        self.page_items
    }

    /// Items in the reserved pool.
    #[inline]
    pub fn reserved_count(&self) -> usize {
        self.reserved
    }

    /// Snapshot of the statistic counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            gets: self.stats.gets.load(Ordering::Relaxed),
            puts: self.stats.puts.load(Ordering::Relaxed),
            finds: self.stats.finds.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
        }
    }

    /// Counters of the page pool shared by every allocator.
    pub fn page_pool_stats() -> PagePoolStats {
        page_pool::pool().stats()
    }

    // ---- Diagnostics ----

    /// Log the shared page pool at debug level.
    pub fn debug_static() {
        page_pool::pool().debug();
    }

    /// Log the allocator state at debug level.
    pub fn debug(&self) {
        debug!(
            allocator = ?(self as *const Self),
            item_size = self.item_size,
            origin = ?self.item_origin,
            ending = ?self.item_ending,
            reserved = self.reserved,
            page_size = self.page_size,
            page_mask = %format!("{:#x}", self.page_mask),
            page_items = self.page_items,
            page_cache = self.page_cache,
            stats = ?self.stats(),
            "allocator"
        );

        {
            let pages = self.pages.lock();
            let mut free_items = 0;
            let mut count = 0;
            let mut next = pages.head;
            while !next.is_null() {
                // SAFETY: linked pages are live under the page latch.
                let page = unsafe { &*next };
                free_items += page.avails;
                count += 1;
                if count <= self.page_cache {
                    debug!(
                        prev = ?page.prev,
                        page = ?next,
                        next = ?page.next,
                        avails = page.avails,
                        head = ?page.head,
                        offset = %format!("{:#x}", page.offset),
                        "..page"
                    );
                } else if count == self.page_cache + 1 {
                    debug!("..** more **");
                }
                next = page.next;
            }
            debug!(
                head = ?pages.head,
                tail = ?pages.tail,
                used_pages = self.get_used_pages(),
                idle = pages.idle,
                free_items,
                "..pages"
            );
        }

        for (index, slot) in self.item_cache.iter().enumerate() {
            debug!(index, item = ?slot.load(Ordering::Relaxed), "..cache");
        }

        let _guard = self.item_latch.guard();
        let mut free_items = 0;
        let mut item = self.item_head.load(Ordering::Acquire);
        while !item.is_null() && free_items <= self.reserved {
            free_items += 1;
            // SAFETY: reserved free items live inside the region.
            item = unsafe { (*item).next };
        }
        debug!(head = ?self.item_head.load(Ordering::Relaxed), free_items, "..reserved");
    }

    /// Verify every internal list. Results are exact only while no other
    /// thread is using the allocator.
    pub fn check(&self) -> Result<()> {
        self.check_reserved()
            .and_then(|()| self.check_pages())
            .inspect_err(|err| warn!(%err, "allocator check failed"))
    }

    fn check_reserved(&self) -> Result<()> {
        let _guard = self.item_latch.guard();
        let cached: Vec<*mut Item> = self
            .item_cache
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|item| !item.is_null())
            .collect();

        let mut seen = vec![false; self.reserved];
        for &item in &cached {
            let index = self.reserved_index(item.cast())?;
            if core::mem::replace(&mut seen[index], true) {
                return Err(Error::corrupted(format!("item {item:?} cached twice")));
            }
        }

        let mut item = self.item_head.load(Ordering::Acquire);
        while !item.is_null() {
            let index = self.reserved_index(item.cast())?;
            if core::mem::replace(&mut seen[index], true) {
                return Err(if cached.contains(&item) {
                    Error::corrupted(format!("free item {item:?} is also cached"))
                } else {
                    Error::corrupted(format!("free item {item:?} duplicated"))
                });
            }
            // SAFETY: index check proved the item lies in the region.
            item = unsafe { (*item).next };
        }
        Ok(())
    }

    fn reserved_index(&self, addr: *const u8) -> Result<usize> {
        if !self.is_reserved(addr) {
            return Err(Error::corrupted(format!("{addr:?} outside the reserved region")));
        }
        let offset = addr as usize - self.item_origin as usize;
        if offset % self.item_size != 0 {
            return Err(Error::corrupted(format!("{addr:?} is not on an item boundary")));
        }
        Ok(offset / self.item_size)
    }

    fn check_pages(&self) -> Result<()> {
        let pages = self.pages.lock();
        let used = self.get_used_pages();
        let mut prev: *mut Page = ptr::null_mut();
        let mut next = pages.head;
        let mut count = 0;
        let mut idle = 0;
        while !next.is_null() {
            count += 1;
            if count > used {
                return Err(Error::corrupted(format!(
                    "more linked pages than used_pages({used})"
                )));
            }
            if next as usize & (self.page_size - 1) != 0 {
                return Err(Error::corrupted(format!("page {next:?} misaligned")));
            }
            // SAFETY: linked pages are live under the page latch.
            let page = unsafe { &*next };
            if page.prev != prev {
                return Err(Error::corrupted(format!(
                    "page {next:?}.prev {:?} != {prev:?}",
                    page.prev
                )));
            }
            self.check_page_items(next, page)?;
            if page.avails == self.page_items {
                idle += 1;
            }
            prev = next;
            next = page.next;
        }

        if pages.tail != prev {
            return Err(Error::corrupted(format!(
                "tail {:?} is not last page {prev:?}",
                pages.tail
            )));
        }
        if count != used {
            return Err(Error::corrupted(format!(
                "{count} linked pages but used_pages({used})"
            )));
        }
        if idle != pages.idle {
            return Err(Error::corrupted(format!(
                "{idle} idle pages but idle count {}",
                pages.idle
            )));
        }
        Ok(())
    }

    fn check_page_items(&self, at: *mut Page, page: &Page) -> Result<()> {
        let never_used = self.page_items - (page.offset - PAGE_PREFIX) / self.item_size;
        let mut free = 0;
        let mut item = page.head;
        while !item.is_null() {
            free += 1;
            if free > self.page_items {
                return Err(Error::corrupted(format!("page {at:?} free list loops")));
            }
            if self.page_of(item).as_ptr() != at {
                return Err(Error::corrupted(format!("page {at:?} holds item {item:?}")));
            }
            let offset = item as usize - at as usize;
            if offset >= page.offset {
                return Err(Error::corrupted(format!(
                    "free item {item:?} beyond offset {:#x}",
                    page.offset
                )));
            }
            // SAFETY: the item lies inside a live page.
            item = unsafe { (*item).next };
        }
        if free + never_used != page.avails {
            return Err(Error::corrupted(format!(
                "page {at:?} avails {} but {free} free + {never_used} unused",
                page.avails
            )));
        }
        Ok(())
    }

    /// Verify that `addr` is currently allocated: it belongs to this
    /// allocator and sits on no free list.
    pub fn check_item(&self, addr: NonNull<u8>) -> Result<()> {
        let target = addr.as_ptr().cast::<Item>();
        if self.is_reserved(addr.as_ptr()) {
            self.reserved_index(addr.as_ptr())?;
            let _guard = self.item_latch.guard();
            for (index, slot) in self.item_cache.iter().enumerate() {
                if slot.load(Ordering::Acquire) == target {
                    return Err(Error::corrupted(format!("item {target:?} is cache[{index}]")));
                }
            }
            let mut item = self.item_head.load(Ordering::Acquire);
            while !item.is_null() {
                if item == target {
                    return Err(Error::corrupted(format!("item {target:?} is on the free list")));
                }
                // SAFETY: reserved free items live inside the region.
                item = unsafe { (*item).next };
            }
            return Ok(());
        }

        let page = self.page_of(target).as_ptr();
        let pages = self.pages.lock();
        let mut next = pages.head;
        while !next.is_null() && next != page {
            // SAFETY: linked pages are live under the page latch.
            next = unsafe { (*next).next };
        }
        if next.is_null() {
            return Err(Error::corrupted(format!("{target:?} is in no linked page")));
        }
        // SAFETY: page is linked.
        let page = unsafe { &*next };
        let offset = target as usize - next as usize;
        if offset < PAGE_PREFIX || offset >= page.offset {
            return Err(Error::corrupted(format!("{target:?} was never handed out")));
        }
        let mut item = page.head;
        while !item.is_null() {
            if item == target {
                return Err(Error::corrupted(format!("item {target:?} is on its page free list")));
            }
            // SAFETY: free items lie inside the live page.
            item = unsafe { (*item).next };
        }
        Ok(())
    }

    /// Whether the page latch is currently held (diagnostics only).
    pub fn is_page_latch_held(&self) -> bool {
        self.pages.is_locked()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if !self.item_origin.is_null() {
            if let Ok(layout) = self.region_layout() {
                // SAFETY: allocated in reserve() with this layout.
                unsafe { std::alloc::dealloc(self.item_origin, layout) };
            }
            self.item_origin = ptr::null_mut();
            self.item_ending = ptr::null_mut();
        }

        let page_size = self.page_size;
        let pages = self.pages.get_mut();
        while let Some(page) = NonNull::new(pages.head) {
            // SAFETY: page is linked; nothing else can reach it during drop.
            unsafe {
                pages.remove(page);
                page::free_page(page, page_size);
            }
        }
        pages.idle = 0;
        self.used_pages.store(0, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Allocator")
            .field("item_size", &self.item_size)
            .field("reserved", &self.reserved)
            .field("page_size", &self.page_size)
            .field("page_items", &self.page_items)
            .field("used_pages", &self.get_used_pages())
            .field("stats", &self.stats())
            .finish()
    }
}
