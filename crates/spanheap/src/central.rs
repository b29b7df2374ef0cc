//! Central free lists, one per size class.
//!
//! A central list owns the spans of its class that no thread cache holds:
//! `nonempty` spans have at least one free slot, `empty` spans have none
//! (or have not been swept yet and might). A span a cache holds is in
//! neither list; frees that reach it through the central list wait on its
//! `deferred` chain until the cache gives it back.
//!
//! The central lock is never held while calling into the page heap or the
//! sweeper.

use std::collections::HashSet;
use std::ptr;

use crate::error::AllocError;
use crate::heap::Heap;
use crate::lock_order::{LockLevel, OrderedGuard, OrderedMutex};
use crate::page_heap::SpanKind;
use crate::size_class::SizeClass;
use crate::span::{FreeChain, Residence, Span, SpanList, SpanState};
use crate::sweep::SweepSpan;

pub(crate) struct Lists {
    pub(crate) nonempty: SpanList,
    pub(crate) empty: SpanList,
}

impl Lists {
    fn list_of(&mut self, span: *mut Span) -> &mut SpanList {
        // SAFETY: called under the central lock on a listed span.
        match unsafe { (*span).residence } {
            Residence::Nonempty => &mut self.nonempty,
            Residence::Empty => &mut self.empty,
            other => panic!("span is {other:?}, not on a central list"),
        }
    }
}

/// Totals from one central list's consistency walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CentralReport {
    pub(crate) nonempty: usize,
    pub(crate) empty: usize,
    pub(crate) capacity: usize,
    pub(crate) free: usize,
}

pub(crate) struct CentralFreeList {
    class: SizeClass,
    lists: OrderedMutex<Lists>,
}

impl CentralFreeList {
    pub(crate) fn new(class: SizeClass) -> Self {
        let level = LockLevel::Central(u8::try_from(class.id).unwrap_or(u8::MAX));
        Self {
            class,
            lists: OrderedMutex::new(
                level,
                Lists {
                    nonempty: SpanList::new(Residence::Nonempty),
                    empty: SpanList::new(Residence::Empty),
                },
            ),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, Lists> {
        self.lists.lock()
    }

    /// Hands a span with at least one free slot to a thread cache.
    ///
    /// Listed spans that still need sweeping are claimed and swept first.
    /// The returned span is `Cached` and in no list.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if no span is reusable and the page heap
    /// cannot supply a new one.
    pub(crate) fn cache_span(&self, heap: &Heap) -> Result<*mut Span, AllocError> {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_refill(self.class.id);

        'retry: loop {
            let sg = heap.pages.sweep_generation();
            let mut lists = self.lists.lock();

            let mut cursor = lists.nonempty.first();
            while !cursor.is_null() {
                let span = cursor;
                // SAFETY: listed spans are live and guarded by our lock.
                unsafe {
                    cursor = (*span).next;
                    if (*span).sweep.try_claim(sg) {
                        lists.nonempty.remove(span);
                        (*span).residence = Residence::Cached;
                        drop(lists);
                        self.sweep_span(heap, span, sg, true);
                        return Ok(span);
                    }
                    if (*span).sweep.is_sweeping() {
                        // Being swept by `Heap::sweep_all`.
                        continue;
                    }
                    lists.nonempty.remove(span);
                    (*span).residence = Residence::Cached;
                    return Ok(span);
                }
            }

            let mut cursor = lists.empty.first();
            while !cursor.is_null() {
                let span = cursor;
                // SAFETY: as above.
                unsafe {
                    cursor = (*span).next;
                    if (*span).sweep.try_claim(sg) {
                        lists.empty.remove(span);
                        (*span).residence = Residence::Cached;
                        drop(lists);
                        self.sweep_span(heap, span, sg, true);
                        if !(*span).freelist.is_null() {
                            return Ok(span);
                        }

                        // Nothing reclaimed. Frees may have been deferred
                        // while we swept; otherwise park it with the swept
                        // spans at the back and scan again.
                        let mut lists = self.lists.lock();
                        Span::splice(span, (*span).deferred.take());
                        if !(*span).freelist.is_null() {
                            return Ok(span);
                        }
                        (*span).residence = Residence::Unlinked;
                        lists.empty.push_back(span);
                        continue 'retry;
                    }
                    if (*span).sweep.is_sweeping() {
                        continue;
                    }
                    // Swept spans sit behind the unswept ones.
                    break;
                }
            }

            drop(lists);
            return self.grow(heap);
        }
    }

    /// Carves a fresh span for this class.
    fn grow(&self, heap: &Heap) -> Result<*mut Span, AllocError> {
        let span = heap
            .pages
            .alloc_span(self.class.pages, SpanKind::Small(self.class.id), true)?;
        // SAFETY: the span is fresh, zeroed and ours.
        unsafe { Span::carve(span) };
        heap.counters.record_span_grown();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_span_grown(self.class.id, self.class.pages);

        Ok(span)
    }

    /// Takes back a span a thread cache is done with.
    ///
    /// # Safety
    ///
    /// `span` must be `Cached` by the caller, who gives up its free list.
    pub(crate) unsafe fn uncache_span(&self, heap: &Heap, span: *mut Span) {
        let mut lists = self.lists.lock();
        unsafe {
            debug_assert_eq!((*span).residence, Residence::Cached);
            Span::splice(span, (*span).deferred.take());
            (*span).residence = Residence::Unlinked;
            if (*span).allocated == 0 {
                drop(lists);
                self.release(heap, span);
            } else if (*span).freelist.is_null() {
                lists.empty.push_back(span);
            } else {
                lists.nonempty.push_front(span);
            }
        }
    }

    /// Returns explicitly freed slots to their spans.
    ///
    /// Slots may belong to different spans of this class. Spans that end up
    /// with no allocated slots go back to the page heap, unless a sweeper
    /// holds them; it releases them when it finishes.
    ///
    /// # Safety
    ///
    /// Every slot must be an allocated slot of this class that nobody uses
    /// any more.
    pub(crate) unsafe fn release_objects(&self, heap: &Heap, mut chain: FreeChain) {
        if chain.is_empty() {
            return;
        }
        let mut drained = Vec::new();
        let mut lists = self.lists.lock();
        while let Some(obj) = chain.pop() {
            let Some(span) = heap.pages.span_of(obj) else {
                panic!("free of {obj:p}: not in an in-use span");
            };
            unsafe {
                debug_assert_eq!((*span).size_class, self.class.id);
                match (*span).residence {
                    Residence::Cached => (*span).deferred.push(obj),
                    Residence::Nonempty | Residence::Empty => {
                        Span::push_free(span, obj);
                        if (*span).residence == Residence::Empty {
                            lists.empty.remove(span);
                            lists.nonempty.push_front(span);
                        }
                        if (*span).allocated == 0 && !(*span).sweep.is_sweeping() {
                            lists.nonempty.remove(span);
                            drained.push(span);
                        }
                    }
                    other => panic!("free of {obj:p}: span is {other:?}"),
                }
            }
        }
        drop(lists);
        for span in drained {
            // SAFETY: unlinked under the lock; nobody else can reach it.
            unsafe { self.release(heap, span) };
        }
    }

    /// Runs the sweeper over a span claimed for generation `sg`.
    ///
    /// With `preserve` the caller holds the span cached and the reclaimed
    /// slots go straight onto its free list.
    unsafe fn sweep_span(&self, heap: &Heap, span: *mut Span, sg: u32, preserve: bool) {
        let mut view = unsafe { SweepSpan::new(span, sg) };
        self.run_sweeper(heap, &mut view);
        unsafe { self.free_span(heap, span, view.into_reclaimed(), sg, preserve) };
    }

    fn run_sweeper(&self, heap: &Heap, view: &mut SweepSpan<'_>) {
        let reclaimed = heap.sweeper.try_sweep(view);
        debug_assert_eq!(
            reclaimed,
            view.reclaimed(),
            "sweeper reported a different count than it reclaimed"
        );
        heap.counters.record_sweep(self.class.id, view.reclaimed());

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_sweep(self.class.id, view.reclaimed(), view.sweep_generation());
    }

    /// Puts slots reclaimed by a sweep back on `span` and stamps it swept.
    ///
    /// Returns `true` if the span went back to the page heap.
    unsafe fn free_span(
        &self,
        heap: &Heap,
        span: *mut Span,
        chain: FreeChain,
        sg: u32,
        preserve: bool,
    ) -> bool {
        if preserve {
            unsafe {
                Span::splice(span, chain);
                (*span).sweep.finish(sg);
            }
            return false;
        }

        let mut lists = self.lists.lock();
        unsafe {
            match (*span).residence {
                Residence::Cached => (*span).deferred.append(chain),
                Residence::Nonempty | Residence::Empty => {
                    Span::splice(span, chain);
                    if (*span).residence == Residence::Empty && !(*span).freelist.is_null() {
                        lists.empty.remove(span);
                        lists.nonempty.push_front(span);
                    }
                }
                other => panic!("swept span at {:#x} is {other:?}", (*span).start),
            }
            // The stamp lets caches take the span; lists must be final first.
            (*span).sweep.finish(sg);

            if (*span).allocated != 0 || (*span).residence == Residence::Cached {
                return false;
            }
            lists.list_of(span).remove(span);
            drop(lists);
            self.release(heap, span);
        }
        true
    }

    /// Sweeps every listed span of this class that still needs it.
    ///
    /// Returns the number of spans swept.
    pub(crate) fn sweep_pending(&self, heap: &Heap) -> usize {
        let mut swept = 0;
        loop {
            let sg = heap.pages.sweep_generation();
            let claimed = {
                let lists = self.lists.lock();
                let span = lists
                    .nonempty
                    .iter()
                    .chain(lists.empty.iter())
                    // SAFETY: listed spans are live and guarded by our lock.
                    .find(|&span| unsafe { (*span).sweep.try_claim(sg) });
                // SAFETY: we hold the claim, so the span stays in use.
                span.map(|span| (span, unsafe { SweepSpan::new(span, sg) }))
            };
            let Some((span, mut view)) = claimed else {
                return swept;
            };

            self.run_sweeper(heap, &mut view);
            // SAFETY: we hold the claim.
            unsafe { self.free_span(heap, span, view.into_reclaimed(), sg, false) };
            swept += 1;
        }
    }

    unsafe fn release(&self, heap: &Heap, span: *mut Span) {
        unsafe {
            debug_assert!((*span).deferred.is_empty());
            (*span).freelist = ptr::null_mut();
            heap.pages.free_span(span);
        }
        heap.counters.record_span_released();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_span_released(self.class.id, self.class.pages);
    }

    /// Checks the lists of this class. The caller holds the lock.
    ///
    /// # Panics
    ///
    /// Panics on a span listed twice, listed under the wrong class, or whose
    /// free list disagrees with its allocated count.
    pub(crate) fn check(&self, lists: &Lists, seen: &mut HashSet<usize>) -> CentralReport {
        let mut report = CentralReport::default();
        for (list, has_free) in [(&lists.nonempty, true), (&lists.empty, false)] {
            for span in list.iter() {
                // SAFETY: listed spans are live and guarded by the held lock.
                unsafe {
                    let start = (*span).start;
                    assert!(seen.insert(span as usize), "span at {start:#x} listed twice");
                    assert_eq!(Span::state(span), SpanState::InUse, "listed span at {start:#x} is not in use");
                    assert_eq!(
                        (*span).size_class,
                        self.class.id,
                        "span at {start:#x} on the wrong central list"
                    );
                    assert!((*span).deferred.is_empty(), "listed span at {start:#x} has deferred frees");
                    assert_eq!(
                        !(*span).freelist.is_null(),
                        has_free,
                        "span at {start:#x} on the {:?} list",
                        list.tag()
                    );
                    let free = Span::count_free(span);
                    assert_eq!(
                        (*span).allocated + free,
                        (*span).objects,
                        "span at {start:#x}: slots not conserved"
                    );
                    report.capacity += (*span).objects;
                    report.free += free;
                }
            }
        }
        report.nonempty = lists.nonempty.len();
        report.empty = lists.empty.len();
        report
    }
}
