//! Address to span lookup.
//!
//! One atomic pointer per arena page, stored in its own reservation and
//! committed as the arena grows. Unwritten entries read as null.
//!
//! Writers hold the page-heap lock. Readers do not lock: they load the
//! published page count first, so they never touch entries beyond the
//! committed part of the map.

use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memory::{MemoryProvider, Region};
use crate::size_class::{PAGE_SHIFT, PAGE_SIZE};
use crate::span::Span;

const ENTRY: usize = size_of::<AtomicPtr<Span>>();

pub(crate) struct PageMap {
    region: Region,
    arena_start: usize,
    pages: usize,
    published: AtomicUsize,
}

impl PageMap {
    pub(crate) fn new(
        provider: &Arc<dyn MemoryProvider>,
        arena_start: usize,
        pages: usize,
    ) -> io::Result<Self> {
        let bytes = (pages * ENTRY).next_multiple_of(PAGE_SIZE);
        let region = Region::reserve(provider, 0, bytes)?;
        Ok(Self {
            region,
            arena_start,
            pages,
            published: AtomicUsize::new(0),
        })
    }

    /// Commits enough of the map to cover `pages` arena pages.
    ///
    /// `committed` is the byte count already committed; the page-heap lock
    /// guards it.
    pub(crate) fn commit_to(&self, pages: usize, committed: &mut usize) -> io::Result<()> {
        debug_assert!(pages <= self.pages);
        let needed = (pages * ENTRY).next_multiple_of(PAGE_SIZE).min(self.region.len());
        if needed <= *committed {
            return Ok(());
        }
        // SAFETY: the range lies inside the map's reservation.
        unsafe {
            let from = self.region.base().add(*committed);
            self.region.provider().commit(from, needed - *committed)?;
        }
        *committed = needed;
        Ok(())
    }

    /// Makes entries for the first `pages` arena pages visible to lookups.
    pub(crate) fn publish(&self, pages: usize) {
        self.published.store(pages, Ordering::Release);
    }

    pub(crate) const fn page_of(&self, addr: usize) -> usize {
        (addr - self.arena_start) >> PAGE_SHIFT
    }

    fn entry(&self, page: usize) -> &AtomicPtr<Span> {
        debug_assert!(page < self.pages);
        // SAFETY: `page` is inside the committed map; AtomicPtr is valid for
        // zeroed memory.
        unsafe { &*self.region.base().as_ptr().cast::<AtomicPtr<Span>>().add(page) }
    }

    /// Reads an entry. Caller holds the page-heap lock or knows the page is
    /// published.
    pub(crate) fn get(&self, page: usize) -> *mut Span {
        self.entry(page).load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, page: usize, span: *mut Span) {
        self.entry(page).store(span, Ordering::Release);
    }

    /// Maps every page of `span` to it.
    ///
    /// # Safety
    ///
    /// `span` must be a live record inside the committed arena.
    pub(crate) unsafe fn set_all(&self, span: *mut Span) {
        let (first, n) = unsafe { (self.page_of((*span).start), (*span).npages) };
        for page in first..first + n {
            self.set(page, span);
        }
    }

    /// Maps the first and last page of `span` to it.
    ///
    /// # Safety
    ///
    /// As for [`PageMap::set_all`].
    pub(crate) unsafe fn set_ends(&self, span: *mut Span) {
        let (first, n) = unsafe { (self.page_of((*span).start), (*span).npages) };
        self.set(first, span);
        self.set(first + n - 1, span);
    }

    /// Lock-free lookup of the record covering `addr`.
    ///
    /// May return a stale or free record; callers check state and range.
    pub(crate) fn lookup(&self, addr: NonNull<u8>) -> *mut Span {
        let addr = addr.as_ptr() as usize;
        if addr < self.arena_start {
            return ptr::null_mut();
        }
        let page = self.page_of(addr);
        if page >= self.published.load(Ordering::Acquire) {
            return ptr::null_mut();
        }
        self.get(page)
    }
}
