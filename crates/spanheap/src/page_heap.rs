//! Page-granular heap.
//!
//! The arena is one contiguous reservation. Pages below the `used` mark are
//! committed and belong to exactly one span, free or in use; pages above it
//! are untouched address space. Free spans sit on 127 exact-length lists
//! (1..=127 pages) plus one list for longer runs.
//!
//! Allocation is first fit over the exact lists, then best fit (lowest
//! address on ties) over the long list. A run that is too long is split and
//! the tail goes back on a list. Freed spans merge with free neighbours on
//! both sides, so no two free spans are ever adjacent.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::AllocError;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::memory::{MemoryProvider, Region};
use crate::page_map::PageMap;
use crate::size_class::{size_classes, PAGE_SHIFT, PAGE_SIZE};
use crate::span::{Residence, Span, SpanList, SpanState};
use crate::span_pool::SpanPool;

/// Runs of this many pages or more share one free list.
pub(crate) const MAX_FREE_LIST: usize = 128;

/// Growth is rounded up to this many pages (64 KiB).
const GROW_ROUND_PAGES: usize = 8;

/// What a span is being allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpanKind {
    /// Slots of one size class; the span starts out cached by the caller.
    Small(usize),
    /// One object of exactly this many bytes.
    Large(usize),
}

/// Page-level counters, guarded by the page-heap lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageStats {
    pub(crate) grows: u64,
    pub(crate) committed_bytes: usize,
    pub(crate) used_pages: usize,
    pub(crate) inuse_pages: usize,
    pub(crate) free_pages: usize,
    pub(crate) released_pages: usize,
    pub(crate) scavenged_bytes: u64,
}

/// Result of a page-heap consistency walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageReport {
    pub(crate) free_spans: usize,
    pub(crate) free_pages: usize,
    pub(crate) released_pages: usize,
    pub(crate) inuse_spans: usize,
    pub(crate) inuse_pages: usize,
}

struct Inner {
    free: Vec<SpanList>,
    large: SpanList,
    pool: SpanPool,
    used_pages: usize,
    map_committed: usize,
    stats: PageStats,
}

// SAFETY: the raw span pointers are only followed under the lock.
unsafe impl Send for Inner {}

impl Inner {
    fn list_for(&mut self, npages: usize) -> &mut SpanList {
        if npages < MAX_FREE_LIST {
            &mut self.free[npages]
        } else {
            &mut self.large
        }
    }
}

pub(crate) struct PageHeap {
    arena: Region,
    arena_start: usize,
    arena_pages: usize,
    grow_chunk_pages: usize,
    map: PageMap,
    sweep_gen: AtomicU32,
    inner: OrderedMutex<Inner>,
}

impl PageHeap {
    /// Reserves the arena and its page map. Nothing is committed yet.
    pub(crate) fn new(
        provider: &Arc<dyn MemoryProvider>,
        arena_bytes: usize,
        arena_hint: usize,
        grow_chunk_bytes: usize,
    ) -> Result<Self, AllocError> {
        // One spare page lets the start be rounded up to page alignment.
        let arena = Region::reserve(provider, arena_hint, arena_bytes + PAGE_SIZE)?;
        let arena_start = (arena.base().as_ptr() as usize).next_multiple_of(PAGE_SIZE);
        let arena_pages = arena_bytes >> PAGE_SHIFT;
        let map = PageMap::new(provider, arena_start, arena_pages)?;

        Ok(Self {
            arena,
            arena_start,
            arena_pages,
            grow_chunk_pages: grow_chunk_bytes >> PAGE_SHIFT,
            map,
            sweep_gen: AtomicU32::new(0),
            inner: OrderedMutex::new(
                LockLevel::PageHeap,
                Inner {
                    free: (0..MAX_FREE_LIST)
                        .map(|_| SpanList::new(Residence::HeapFree))
                        .collect(),
                    large: SpanList::new(Residence::HeapFree),
                    pool: SpanPool::new(),
                    used_pages: 0,
                    map_committed: 0,
                    stats: PageStats::default(),
                },
            ),
        })
    }

    pub(crate) fn sweep_generation(&self) -> u32 {
        self.sweep_gen.load(Ordering::Acquire)
    }

    pub(crate) fn advance_generation(&self) -> u32 {
        self.sweep_gen
            .fetch_add(2, Ordering::AcqRel)
            .wrapping_add(2)
    }

    pub(crate) const fn arena_bytes(&self) -> usize {
        self.arena_pages << PAGE_SHIFT
    }

    /// Allocates a span of `npages` pages.
    ///
    /// The span is in use and mapped on return. Small spans come back
    /// `Cached` and uncarved; large spans come back `Large` with `limit` set
    /// to the exact object end. With `needzero`, memory that may hold old
    /// data is cleared (outside the lock).
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if the arena is exhausted or the provider
    /// refuses to commit.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        kind: SpanKind,
        needzero: bool,
    ) -> Result<*mut Span, AllocError> {
        debug_assert!(npages > 0);
        let span = {
            let mut inner = self.inner.lock();
            let span = self.alloc_span_locked(&mut inner, npages)?;
            // SAFETY: the span was just taken off a free list and is ours.
            unsafe { self.init_in_use(&mut inner, span, kind) };
            span
        };

        // SAFETY: the span is in use and owned by the caller.
        unsafe {
            if needzero && (*span).needzero {
                ptr::write_bytes((*span).start as *mut u8, 0, npages << PAGE_SHIFT);
                (*span).needzero = false;
            }
        }
        Ok(span)
    }

    fn alloc_span_locked(&self, inner: &mut Inner, npages: usize) -> Result<*mut Span, AllocError> {
        let span = match Self::take_free(inner, npages) {
            Some(span) => span,
            None => {
                self.grow(inner, npages)?;
                Self::take_free(inner, npages).ok_or(AllocError::OutOfMemory {
                    requested: npages << PAGE_SHIFT,
                })?
            }
        };

        // SAFETY: `span` is unlinked and owned by us under the lock.
        unsafe {
            // Recommit the whole run, so the split tail is committed too.
            if (*span).released > 0 {
                let start = NonNull::new_unchecked((*span).start as *mut u8);
                let len = (*span).npages << PAGE_SHIFT;
                if self.arena.provider().commit(start, len).is_err() {
                    self.free_span_locked(inner, span);
                    return Err(AllocError::OutOfMemory { requested: len });
                }
                inner.stats.committed_bytes += (*span).released << PAGE_SHIFT;
                (*span).released = 0;
            }
            if (*span).npages > npages {
                self.split(inner, span, npages);
            }
        }
        Ok(span)
    }

    /// Unlinks the first fitting span, if any.
    fn take_free(inner: &mut Inner, npages: usize) -> Option<*mut Span> {
        for n in npages..MAX_FREE_LIST {
            let span = inner.free[n].first();
            if !span.is_null() {
                // SAFETY: list members are live free records.
                unsafe { inner.free[n].remove(span) };
                return Some(span);
            }
        }

        let mut best: *mut Span = ptr::null_mut();
        for span in inner.large.iter() {
            // SAFETY: list members are live free records.
            unsafe {
                if (*span).npages < npages {
                    continue;
                }
                if best.is_null()
                    || (*span).npages < (*best).npages
                    || ((*span).npages == (*best).npages && (*span).start < (*best).start)
                {
                    best = span;
                }
            }
        }
        if best.is_null() {
            return None;
        }
        // SAFETY: `best` is on the large list.
        unsafe { inner.large.remove(best) };
        Some(best)
    }

    /// Cuts `span` to `npages` and frees the tail. `span` must be fully
    /// committed.
    unsafe fn split(&self, inner: &mut Inner, span: *mut Span, npages: usize) {
        let tail = inner.pool.alloc();
        unsafe {
            debug_assert_eq!((*span).released, 0);
            (*tail).start = (*span).start + (npages << PAGE_SHIFT);
            (*tail).npages = (*span).npages - npages;
            (*tail).needzero = (*span).needzero;
            (*span).npages = npages;
            Span::set_state(tail, SpanState::Free);
            self.map.set_ends(tail);
            inner.list_for((*tail).npages).push_front(tail);
        }
    }

    unsafe fn init_in_use(&self, inner: &mut Inner, span: *mut Span, kind: SpanKind) {
        unsafe {
            let start = (*span).start;
            let bytes = (*span).npages << PAGE_SHIFT;
            (*span).freelist = ptr::null_mut();
            (*span).deferred.take();
            (*span).sweep.store(self.sweep_generation());
            Span::set_descriptor(span, 0);
            match kind {
                SpanKind::Small(class) => {
                    let class = size_classes().class(class);
                    (*span).size_class = class.id;
                    (*span).elem_size = class.size;
                    (*span).objects = class.objects;
                    (*span).magic = class.magic;
                    (*span).limit = start + class.objects * class.size;
                    (*span).allocated = 0;
                    (*span).residence = Residence::Cached;
                }
                SpanKind::Large(size) => {
                    (*span).size_class = 0;
                    (*span).elem_size = bytes;
                    (*span).objects = 1;
                    (*span).magic = Default::default();
                    (*span).limit = start + size;
                    (*span).allocated = 1;
                    (*span).residence = Residence::Large;
                }
            }
            self.map.set_all(span);
            Span::set_state(span, SpanState::InUse);
            inner.stats.inuse_pages += (*span).npages;
        }
    }

    /// Commits at least `npages` more pages of arena and frees them.
    fn grow(&self, inner: &mut Inner, npages: usize) -> Result<(), AllocError> {
        let avail = self.arena_pages - inner.used_pages;
        let ask = npages
            .next_multiple_of(GROW_ROUND_PAGES)
            .max(self.grow_chunk_pages)
            .min(avail);
        if ask < npages {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_arena_exhausted(npages, avail);
            return Err(AllocError::OutOfMemory {
                requested: npages << PAGE_SHIFT,
            });
        }

        let start = self.arena_start + (inner.used_pages << PAGE_SHIFT);
        let bytes = ask << PAGE_SHIFT;
        let oom = |_| AllocError::OutOfMemory { requested: bytes };
        // SAFETY: [start, start + bytes) lies inside the arena reservation.
        unsafe {
            self.arena
                .provider()
                .commit(NonNull::new_unchecked(start as *mut u8), bytes)
                .map_err(oom)?;
        }
        if let Err(err) = self.map.commit_to(inner.used_pages + ask, &mut inner.map_committed) {
            // SAFETY: committed just above and not handed out.
            let _ = unsafe {
                self.arena
                    .provider()
                    .decommit(NonNull::new_unchecked(start as *mut u8), bytes)
            };
            return Err(oom(err));
        }

        let span = inner.pool.alloc();
        // SAFETY: the fresh record is ours; the pages are committed.
        unsafe {
            (*span).start = start;
            (*span).npages = ask;
            Span::set_state(span, SpanState::InUse);
            self.map.set_ends(span);
        }
        inner.used_pages += ask;
        self.map.publish(inner.used_pages);
        inner.stats.grows += 1;
        inner.stats.committed_bytes += bytes;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_grow(ask, inner.used_pages);

        // SAFETY: as above; merges with a free run just below, if any.
        unsafe { self.free_span_locked(inner, span) };
        Ok(())
    }

    /// Returns an in-use span's pages to the heap.
    ///
    /// # Safety
    ///
    /// `span` must be in use, on no list, and unreachable by anyone else.
    pub(crate) unsafe fn free_span(&self, span: *mut Span) {
        let mut inner = self.inner.lock();
        unsafe {
            assert_eq!(
                Span::state(span),
                SpanState::InUse,
                "free of span at {:#x} that is not in use",
                (*span).start
            );
            assert!(
                matches!((*span).residence, Residence::Unlinked | Residence::Large),
                "free of span at {:#x} while {:?}",
                (*span).start,
                (*span).residence
            );
            inner.stats.inuse_pages -= (*span).npages;
            (*span).residence = Residence::Unlinked;
            (*span).freelist = ptr::null_mut();
            (*span).allocated = 0;
            (*span).needzero = true;
            self.free_span_locked(&mut inner, span);
        }
    }

    /// Marks `span` free, merges it with free neighbours and lists it.
    unsafe fn free_span_locked(&self, inner: &mut Inner, span: *mut Span) {
        unsafe {
            Span::set_state(span, SpanState::Free);
            (*span).residence = Residence::Unlinked;

            let first = self.map.page_of((*span).start);
            if first > 0 {
                let left = self.map.get(first - 1);
                if !left.is_null() && Span::state(left) == SpanState::Free {
                    (*span).start = (*left).start;
                    (*span).npages += (*left).npages;
                    (*span).needzero |= (*left).needzero;
                    (*span).released += (*left).released;
                    inner.list_for((*left).npages).remove(left);
                    inner.pool.release(left);
                }
            }

            let after = self.map.page_of((*span).start) + (*span).npages;
            if after < inner.used_pages {
                let right = self.map.get(after);
                if !right.is_null() && Span::state(right) == SpanState::Free {
                    (*span).npages += (*right).npages;
                    (*span).needzero |= (*right).needzero;
                    (*span).released += (*right).released;
                    inner.list_for((*right).npages).remove(right);
                    inner.pool.release(right);
                }
            }

            self.map.set_ends(span);
            inner.list_for((*span).npages).push_front(span);
        }
    }

    /// Lock-free lookup of the in-use span containing `addr`.
    ///
    /// `addr` must lie inside an allocation that stays live for the call:
    /// only then can the span not be freed and merged while its page range
    /// is read. Arbitrary addresses go through [`PageHeap::inspect`].
    pub(crate) fn span_of(&self, addr: NonNull<u8>) -> Option<*mut Span> {
        let span = self.map.lookup(addr);
        if span.is_null() {
            return None;
        }
        let addr = addr.as_ptr() as usize;
        // SAFETY: records are never freed while the heap lives.
        unsafe {
            if Span::state(span) != SpanState::InUse || addr < (*span).start || addr >= Span::end(span)
            {
                return None;
            }
        }
        Some(span)
    }

    /// Runs `f` on the in-use span containing `addr`, if any, with the heap
    /// lock held so that no record's page range changes meanwhile.
    pub(crate) fn inspect<R>(&self, addr: NonNull<u8>, f: impl FnOnce(*mut Span) -> R) -> Option<R> {
        let _inner = self.inner.lock();
        self.span_of(addr).map(f)
    }

    /// Decommits every free span not yet decommitted. Returns bytes released.
    ///
    /// # Errors
    ///
    /// [`AllocError::Os`] if the provider fails; spans released before the
    /// failure stay released.
    pub(crate) fn scavenge(&self) -> Result<usize, AllocError> {
        let mut inner = self.inner.lock();
        let mut released = 0;
        let mut failure = None;
        'lists: for list in inner.free.iter().chain(std::iter::once(&inner.large)) {
            for span in list.iter() {
                // SAFETY: free spans are owned by the heap under the lock.
                unsafe {
                    let npages = (*span).npages;
                    if (*span).released == npages {
                        continue;
                    }
                    let start = NonNull::new_unchecked((*span).start as *mut u8);
                    if let Err(err) = self.arena.provider().decommit(start, npages << PAGE_SHIFT) {
                        failure = Some(err);
                        break 'lists;
                    }
                    released += (npages - (*span).released) << PAGE_SHIFT;
                    (*span).released = npages;
                    (*span).needzero = true;
                }
            }
        }
        inner.stats.committed_bytes -= released;
        inner.stats.scavenged_bytes += released as u64;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_scavenge(released, inner.stats.committed_bytes);

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(released),
        }
    }

    pub(crate) fn stats(&self) -> PageStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats;
        stats.used_pages = inner.used_pages;
        for list in inner.free.iter().chain(std::iter::once(&inner.large)) {
            for span in list.iter() {
                // SAFETY: free spans are owned by the heap under the lock.
                unsafe {
                    stats.free_pages += (*span).npages;
                    stats.released_pages += (*span).released;
                }
            }
        }
        stats
    }

    /// Checks the free lists and page map and visits every in-use span.
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency.
    pub(crate) fn verify(&self, mut visit: impl FnMut(*mut Span)) -> PageReport {
        let inner = self.inner.lock();
        let mut report = PageReport::default();

        for (n, list) in inner.free.iter().enumerate().chain(std::iter::once((MAX_FREE_LIST, &inner.large))) {
            for span in list.iter() {
                // SAFETY: list members are live records under the lock.
                unsafe {
                    let start = (*span).start;
                    assert_eq!(Span::state(span), SpanState::Free, "listed span at {start:#x} is not free");
                    assert_eq!((*span).residence, Residence::HeapFree);
                    if n < MAX_FREE_LIST {
                        assert_eq!((*span).npages, n, "span at {start:#x} on the wrong free list");
                    } else {
                        assert!((*span).npages >= MAX_FREE_LIST);
                    }
                    let first = self.map.page_of(start);
                    let last = first + (*span).npages - 1;
                    assert_eq!(self.map.get(first), span, "first page of free span at {start:#x} unmapped");
                    assert_eq!(self.map.get(last), span, "last page of free span at {start:#x} unmapped");
                    if first > 0 {
                        let left = self.map.get(first - 1);
                        assert!(
                            Span::state(left) != SpanState::Free,
                            "free span at {start:#x} has a free left neighbour"
                        );
                    }
                    if last + 1 < inner.used_pages {
                        let right = self.map.get(last + 1);
                        assert!(
                            Span::state(right) != SpanState::Free,
                            "free span at {start:#x} has a free right neighbour"
                        );
                    }
                    report.free_spans += 1;
                    report.free_pages += (*span).npages;
                    assert!((*span).released <= (*span).npages);
                    report.released_pages += (*span).released;
                }
            }
        }

        let mut free_records = 0;
        for &span in inner.pool.records() {
            // SAFETY: pool records are never freed while the heap lives.
            unsafe {
                match Span::state(span) {
                    SpanState::Dead => {}
                    SpanState::Free => free_records += 1,
                    SpanState::InUse => {
                        let first = self.map.page_of((*span).start);
                        for page in first..first + (*span).npages {
                            assert_eq!(
                                self.map.get(page),
                                span,
                                "page {page} of in-use span at {:#x} maps elsewhere",
                                (*span).start
                            );
                        }
                        report.inuse_spans += 1;
                        report.inuse_pages += (*span).npages;
                        visit(span);
                    }
                }
            }
        }

        assert_eq!(free_records, report.free_spans, "free span records missing from the free lists");
        assert_eq!(report.inuse_pages, inner.stats.inuse_pages, "in-use page count drifted");
        assert_eq!(
            report.free_pages + report.inuse_pages,
            inner.used_pages,
            "arena pages are not all accounted for"
        );
        assert_eq!(inner.pool.live(), report.free_spans + report.inuse_spans);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::Budgeted;
    use crate::memory::SystemMemory;

    const ARENA: usize = 64 << 20;

    fn heap() -> PageHeap {
        let provider: Arc<dyn MemoryProvider> = Arc::new(SystemMemory);
        PageHeap::new(&provider, ARENA, 0, 1 << 20).unwrap()
    }

    fn start(span: *mut Span) -> usize {
        unsafe { (*span).start }
    }

    #[test]
    fn test_first_alloc_grows_one_chunk() {
        let heap = heap();
        let span = heap.alloc_span(1, SpanKind::Large(100), true).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.grows, 1);
        assert_eq!(stats.used_pages, 128);
        assert_eq!(stats.inuse_pages, 1);
        assert_eq!(stats.free_pages, 127);
        unsafe {
            assert_eq!((*span).limit, (*span).start + 100);
            assert_eq!((*span).residence, Residence::Large);
        }
        heap.verify(|_| {});
    }

    #[test]
    fn test_split_and_coalesce() {
        let heap = heap();
        let a = heap.alloc_span(4, SpanKind::Large(4 * PAGE_SIZE), true).unwrap();
        let b = heap.alloc_span(4, SpanKind::Large(4 * PAGE_SIZE), true).unwrap();
        let c = heap.alloc_span(4, SpanKind::Large(4 * PAGE_SIZE), true).unwrap();
        assert_eq!(start(b), start(a) + 4 * PAGE_SIZE);
        assert_eq!(start(c), start(b) + 4 * PAGE_SIZE);

        unsafe {
            heap.free_span(a);
            heap.free_span(c);
        }
        // a alone, and c merged with the tail of the chunk.
        let report = heap.verify(|_| {});
        assert_eq!(report.free_spans, 2);

        unsafe { heap.free_span(b) };
        let report = heap.verify(|_| {});
        assert_eq!(report.free_spans, 1);
        assert_eq!(report.free_pages, 128);
    }

    #[test]
    fn test_reuse_lowest_fit() {
        let heap = heap();
        let a = heap.alloc_span(2, SpanKind::Large(1), true).unwrap();
        let _b = heap.alloc_span(2, SpanKind::Large(1), true).unwrap();
        let a_start = start(a);
        unsafe { heap.free_span(a) };
        let again = heap.alloc_span(1, SpanKind::Large(1), true).unwrap();
        assert_eq!(start(again), a_start);
        heap.verify(|_| {});
    }

    #[test]
    fn test_reused_span_is_zeroed() {
        let heap = heap();
        let a = heap.alloc_span(1, SpanKind::Large(PAGE_SIZE), true).unwrap();
        unsafe {
            ptr::write_bytes((*a).start as *mut u8, 0xAB, PAGE_SIZE);
            let addr = (*a).start;
            heap.free_span(a);
            let b = heap.alloc_span(1, SpanKind::Large(PAGE_SIZE), true).unwrap();
            assert_eq!((*b).start, addr);
            let bytes = std::slice::from_raw_parts(addr as *const u8, PAGE_SIZE);
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_large_run_grows_exactly() {
        let heap = heap();
        let span = heap.alloc_span(300, SpanKind::Large(300 * PAGE_SIZE), true).unwrap();
        unsafe { assert_eq!((*span).npages, 300) };
        let stats = heap.stats();
        // 300 pages rounds up to 304, larger than the 1 MiB chunk.
        assert_eq!(stats.used_pages, 304);
        heap.verify(|_| {});
    }

    #[test]
    fn test_grow_coalesces_with_free_tail() {
        let heap = heap();
        let a = heap.alloc_span(100, SpanKind::Large(1), true).unwrap();
        // 28 free pages at the end of the first chunk; 200 more do not fit.
        let b = heap.alloc_span(200, SpanKind::Large(1), true).unwrap();
        assert_eq!(start(b), start(a) + 100 * PAGE_SIZE);
        heap.verify(|_| {});
    }

    #[test]
    fn test_budget_exhaustion_is_out_of_memory() {
        let provider: Arc<dyn MemoryProvider> = Arc::new(Budgeted::new(2 << 20));
        let heap = PageHeap::new(&provider, ARENA, 0, 1 << 20).unwrap();
        heap.alloc_span(64, SpanKind::Large(1), true).unwrap();
        let err = heap.alloc_span(512, SpanKind::Large(1), true).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        heap.verify(|_| {});
    }

    #[test]
    fn test_arena_exhaustion_is_out_of_memory() {
        let provider: Arc<dyn MemoryProvider> = Arc::new(SystemMemory);
        let heap = PageHeap::new(&provider, 1 << 20, 0, 1 << 20).unwrap();
        heap.alloc_span(128, SpanKind::Large(1), true).unwrap();
        let err = heap.alloc_span(1, SpanKind::Large(1), true).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
    }

    #[test]
    fn test_failed_map_commit_gives_arena_back() {
        // Room for the first chunk but not for the page map behind it.
        let budget = Arc::new(Budgeted::new(1 << 20));
        let provider: Arc<dyn MemoryProvider> = budget.clone();
        let heap = PageHeap::new(&provider, ARENA, 0, 1 << 20).unwrap();

        let err = heap.alloc_span(1, SpanKind::Large(1), true).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        assert_eq!(budget.committed.load(Ordering::Relaxed), 0);
        assert_eq!(budget.decommitted.load(Ordering::Relaxed), 1 << 20);
        let stats = heap.stats();
        assert_eq!(stats.grows, 0);
        assert_eq!(stats.used_pages, 0);
        assert_eq!(stats.committed_bytes, 0);
    }

    #[test]
    fn test_scavenge_and_recommit() {
        let budget = Arc::new(Budgeted::new(ARENA));
        let provider: Arc<dyn MemoryProvider> = budget.clone();
        let heap = PageHeap::new(&provider, ARENA, 0, 1 << 20).unwrap();
        let a = heap.alloc_span(8, SpanKind::Large(1), true).unwrap();
        unsafe { heap.free_span(a) };

        let released = heap.scavenge().unwrap();
        assert_eq!(released, 1 << 20);
        assert_eq!(heap.stats().released_pages, 128);
        assert_eq!(heap.scavenge().unwrap(), 0);

        let b = heap.alloc_span(8, SpanKind::Large(1), true).unwrap();
        unsafe {
            ((*b).start as *mut u8).write(1);
        }
        let stats = heap.stats();
        assert_eq!(stats.released_pages, 0);
        assert_eq!(stats.committed_bytes, 1 << 20);
        assert!(budget.decommitted.load(Ordering::Relaxed) >= 1 << 20);
        heap.verify(|_| {});
    }

    #[test]
    fn test_span_of_rejects_foreign_and_free() {
        let heap = heap();
        let a = heap.alloc_span(2, SpanKind::Large(1), true).unwrap();
        let inside = NonNull::new((start(a) + PAGE_SIZE + 8) as *mut u8).unwrap();
        assert_eq!(heap.span_of(inside), Some(a));

        let local = 0u64;
        assert_eq!(heap.span_of(NonNull::from(&local).cast()), None);

        unsafe { heap.free_span(a) };
        assert_eq!(heap.span_of(inside), None);
    }

    #[test]
    fn test_inspect_reads_live_span() {
        let heap = heap();
        let a = heap.alloc_span(3, SpanKind::Large(1), true).unwrap();
        let inside = NonNull::new((start(a) + 2 * PAGE_SIZE) as *mut u8).unwrap();
        assert_eq!(heap.inspect(inside, |span| unsafe { (*span).npages }), Some(3));

        unsafe { heap.free_span(a) };
        assert_eq!(heap.inspect(inside, |span| span), None);
    }

    #[test]
    fn test_generation_advances_by_two() {
        let heap = heap();
        assert_eq!(heap.sweep_generation(), 0);
        assert_eq!(heap.advance_generation(), 2);
        assert_eq!(heap.sweep_generation(), 2);
    }
}
