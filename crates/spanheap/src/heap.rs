//! The allocator context.
//!
//! A [`Heap`] owns the arena, the page heap, one central free list per size
//! class and the sweeper. Threads allocate through their own
//! [`ThreadCache`], which borrows the heap; several heaps may coexist in one
//! process.

use std::alloc::{handle_alloc_error, Layout};
use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::central::CentralFreeList;
use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::memory::{MemoryProvider, SystemMemory};
use crate::metrics::{HeapCounters, HeapStats};
use crate::page_heap::{PageHeap, SpanKind};
use crate::size_class::{size_classes, PAGE_SIZE};
use crate::span::{Residence, Span, SpanState};
use crate::sweep::{NoopSweeper, ScanDescriptor, SweepStatus, Sweeper};
use crate::thread_cache::{AllocFlags, ThreadCache};

/// Target of every zero-size allocation.
static ZERO_SIZED: u64 = 0;

// ============================================================================
// Builder
// ============================================================================

/// Configures and creates a [`Heap`].
pub struct HeapBuilder {
    config: HeapConfig,
    memory: Arc<dyn MemoryProvider>,
    sweeper: Box<dyn Sweeper>,
}

impl HeapBuilder {
    fn new() -> Self {
        Self {
            config: HeapConfig::default(),
            memory: Arc::new(SystemMemory),
            sweeper: Box::new(NoopSweeper),
        }
    }

    /// Sets the heap configuration.
    #[must_use]
    pub const fn config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the provider of address space and physical memory.
    #[must_use]
    pub fn memory(mut self, memory: impl MemoryProvider + 'static) -> Self {
        self.memory = Arc::new(memory);
        self
    }

    /// Sets the sweeper consulted before spans are reused.
    #[must_use]
    pub fn sweeper(mut self, sweeper: impl Sweeper + 'static) -> Self {
        self.sweeper = Box::new(sweeper);
        self
    }

    /// Reserves the arena and builds the heap.
    ///
    /// # Errors
    ///
    /// [`AllocError::Configuration`] for an unusable configuration,
    /// [`AllocError::Os`] if the arena cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if the size-class table fails its consistency checks.
    pub fn build(self) -> Result<Heap, AllocError> {
        self.config.validate()?;
        let classes = size_classes();
        let pages = PageHeap::new(
            &self.memory,
            self.config.arena_bytes,
            self.config.arena_hint,
            self.config.grow_chunk_bytes,
        )?;
        let central = classes
            .iter()
            .map(|class| CachePadded::new(CentralFreeList::new(*class)))
            .collect();

        Ok(Heap {
            config: self.config,
            pages,
            central,
            sweeper: self.sweeper,
            counters: HeapCounters::new(),
        })
    }
}

impl fmt::Debug for HeapBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Introspection types
// ============================================================================

/// What the heap knows about the span holding an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    /// First byte of the span.
    pub start: NonNull<u8>,
    /// Pages in the span.
    pub pages: usize,
    /// Size class, 0 for a large object.
    pub size_class: usize,
    /// Slot size; for a large object, the page-rounded span size.
    pub object_size: usize,
    /// Start of the slot (or large object) containing the address.
    pub object: NonNull<u8>,
    /// Bytes usable from `start`; a large object's exact size.
    pub limit: usize,
    /// Lifecycle state of the span.
    pub state: SpanState,
    /// Sweep status in the current generation.
    pub sweep: SweepStatus,
    /// Scanning descriptor set by the embedder.
    pub descriptor: ScanDescriptor,
}

/// Totals from [`Heap::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Small-object spans in use.
    pub small_spans: usize,
    /// Large-object spans in use.
    pub large_spans: usize,
    /// Small spans held by thread caches.
    pub cached_spans: usize,
    /// Spans on central `nonempty` lists.
    pub nonempty_spans: usize,
    /// Spans on central `empty` lists.
    pub empty_spans: usize,
    /// In-use spans between two containers (being released).
    pub moving_spans: usize,
    /// Free spans in the page heap.
    pub free_spans: usize,
    /// Pages in in-use spans.
    pub inuse_pages: usize,
    /// Pages in free spans.
    pub free_pages: usize,
    /// Free pages returned to the system.
    pub released_pages: usize,
    /// Slots carved in centrally listed spans.
    pub listed_slots: usize,
    /// Free slots in centrally listed spans.
    pub listed_free: usize,
}

// ============================================================================
// Heap
// ============================================================================

/// A concurrent size-class heap.
///
/// # Examples
///
/// ```
/// use spanheap::{AllocFlags, Heap, HeapConfig};
///
/// let heap = Heap::builder()
///     .config(HeapConfig::default().with_arena_bytes(64 << 20))
///     .build()
///     .unwrap();
///
/// std::thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| {
///             let mut cache = heap.thread_cache();
///             let p = cache.allocate(100, AllocFlags::NONE).unwrap();
///             unsafe { cache.free(p) };
///         });
///     }
/// });
/// heap.verify();
/// ```
pub struct Heap {
    config: HeapConfig,
    pub(crate) pages: PageHeap,
    /// Indexed by class id minus one.
    central: Box<[CachePadded<CentralFreeList>]>,
    pub(crate) sweeper: Box<dyn Sweeper>,
    pub(crate) counters: HeapCounters,
}

impl Heap {
    /// Creates a heap with the default configuration, system memory and no
    /// sweeper.
    ///
    /// # Errors
    ///
    /// See [`HeapBuilder::build`].
    pub fn new() -> Result<Self, AllocError> {
        Self::builder().build()
    }

    /// Starts configuring a heap.
    #[must_use]
    pub fn builder() -> HeapBuilder {
        HeapBuilder::new()
    }

    /// The heap's configuration.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Creates an allocation front end for the calling thread.
    #[must_use]
    pub fn thread_cache(&self) -> ThreadCache<'_> {
        ThreadCache::new(self)
    }

    pub(crate) fn central(&self, class: usize) -> &CentralFreeList {
        &self.central[class - 1]
    }

    pub(crate) fn zero_sized() -> NonNull<u8> {
        NonNull::from(&ZERO_SIZED).cast()
    }

    pub(crate) fn allocate_large(&self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
        let npages = size.div_ceil(PAGE_SIZE);
        let needzero = !flags.contains(AllocFlags::NO_ZERO);
        let span = self.pages.alloc_span(npages, SpanKind::Large(size), needzero)?;
        self.counters.record_large_alloc(size);
        // SAFETY: the span is ours and starts inside the arena.
        Ok(unsafe { NonNull::new_unchecked((*span).start as *mut u8) })
    }

    /// # Safety
    ///
    /// `span` must be the in-use large span holding `ptr`, freed by nobody else.
    pub(crate) unsafe fn free_large(&self, span: *mut Span, ptr: NonNull<u8>) {
        let (start, limit) = unsafe { ((*span).start, (*span).limit) };
        assert_eq!(
            ptr.as_ptr() as usize,
            start,
            "free of {ptr:p}: not the start of a large object"
        );
        self.counters.record_large_free(limit - start);
        unsafe { self.pages.free_span(span) };
    }

    pub(crate) fn out_of_memory(requested: usize) -> ! {
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_out_of_memory(requested);

        let layout = Layout::from_size_align(requested.max(1), 8).unwrap_or(Layout::new::<u64>());
        handle_alloc_error(layout)
    }

    /// Current sweep generation. Advances by 2 per cycle.
    #[must_use]
    pub fn sweep_generation(&self) -> u32 {
        self.pages.sweep_generation()
    }

    /// Finishes the current sweep cycle and starts the next one.
    ///
    /// Every listed span still needing a sweep is swept first; after the
    /// advance every span is marked as needing one. Thread caches must be
    /// flushed beforehand: a span cached across the advance is never
    /// swept. Returns the new generation.
    pub fn advance_sweep_generation(&self) -> u32 {
        self.sweep_all();
        let generation = self.pages.advance_generation();

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_generation(generation);

        generation
    }

    /// Sweeps every centrally listed span still stamped as needing a
    /// sweep. Returns the number of spans swept.
    ///
    /// Safe to run concurrently with allocation: the claim on each span
    /// makes sure only one actor sweeps it.
    pub fn sweep_all(&self) -> usize {
        self.central.iter().map(|c| c.sweep_pending(self)).sum()
    }

    /// Snapshot of the heap's statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let pages = self.pages.stats();
        let mut stats = HeapStats {
            arena_bytes: self.pages.arena_bytes(),
            system_bytes: pages.committed_bytes,
            grows: pages.grows,
            used_pages: pages.used_pages,
            inuse_pages: pages.inuse_pages,
            free_pages: pages.free_pages,
            released_pages: pages.released_pages,
            scavenged_bytes: pages.scavenged_bytes,
            ..HeapStats::default()
        };
        let classes = size_classes();
        self.counters.fill(&mut stats, |class| classes.class_size(class));
        stats
    }

    /// Describes the in-use span holding `ptr`, or `None` if `ptr` is not
    /// inside a live span's usable bytes.
    #[must_use]
    pub fn span_info(&self, ptr: NonNull<u8>) -> Option<SpanInfo> {
        let addr = ptr.as_ptr() as usize;
        let sg = self.sweep_generation();
        // SAFETY: the page-heap lock keeps the in-use record's fields fixed.
        self.pages.inspect(ptr, |span| unsafe {
            let start = (*span).start;
            if addr >= (*span).limit {
                return None;
            }
            let object = if (*span).size_class == 0 {
                start
            } else {
                let index = (*span).magic.slot_index(addr - start);
                start + index * (*span).elem_size
            };
            Some(SpanInfo {
                start: NonNull::new_unchecked(start as *mut u8),
                pages: (*span).npages,
                size_class: (*span).size_class,
                object_size: (*span).elem_size,
                object: NonNull::new_unchecked(object as *mut u8),
                limit: (*span).limit - start,
                state: Span::state(span),
                sweep: (*span).sweep.status(sg),
                descriptor: ScanDescriptor(Span::descriptor(span)),
            })
        })
        .flatten()
    }

    /// Usable bytes of the object starting at `ptr`.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let info = self.span_info(ptr)?;
        if info.object != ptr {
            return None;
        }
        Some(if info.size_class == 0 {
            info.limit
        } else {
            info.object_size
        })
    }

    /// Attaches a scanning descriptor to the span holding `ptr`.
    ///
    /// Returns `false` if `ptr` is not in an in-use span.
    pub fn set_scan_descriptor(&self, ptr: NonNull<u8>, descriptor: ScanDescriptor) -> bool {
        self.pages
            // SAFETY: the record is in use; the descriptor is atomic.
            .inspect(ptr, |span| unsafe { Span::set_descriptor(span, descriptor.0) })
            .is_some()
    }

    /// Returns the physical memory of every free span to the system.
    ///
    /// The address space stays reserved; reusing the pages commits them
    /// again. Returns the number of bytes released.
    ///
    /// # Errors
    ///
    /// [`AllocError::Os`] if the provider fails to decommit.
    pub fn release_free_memory(&self) -> Result<usize, AllocError> {
        self.pages.scavenge()
    }

    /// Walks every span and list and checks the heap's invariants.
    ///
    /// Takes every central lock in class order, then the page-heap lock, so
    /// it may run while other threads allocate.
    ///
    /// # Panics
    ///
    /// Panics if a span sits in two containers, a free list is corrupt,
    /// slots are not conserved, free spans are left uncoalesced or the page
    /// map disagrees with the span records.
    pub fn verify(&self) -> HeapReport {
        let guards: Vec<_> = self.central.iter().map(|c| c.lock()).collect();
        let mut report = HeapReport::default();
        let mut listed = HashSet::new();
        for (central, lists) in self.central.iter().zip(&guards) {
            let r = central.check(lists, &mut listed);
            report.nonempty_spans += r.nonempty;
            report.empty_spans += r.empty;
            report.listed_slots += r.capacity;
            report.listed_free += r.free;
        }

        let pages = self.pages.verify(|span| {
            // SAFETY: visited under every lock that guards `residence`.
            unsafe {
                let start = (*span).start;
                match (*span).residence {
                    Residence::Nonempty | Residence::Empty => {
                        assert!(
                            listed.remove(&(span as usize)),
                            "span at {start:#x} claims a central list it is not on"
                        );
                    }
                    Residence::Cached => report.cached_spans += 1,
                    Residence::Large => {
                        assert_eq!((*span).size_class, 0, "large span at {start:#x} has a class");
                        assert!((*span).limit <= Span::end(span));
                        report.large_spans += 1;
                    }
                    Residence::Unlinked => report.moving_spans += 1,
                    Residence::HeapFree => panic!("in-use span at {start:#x} is on a heap free list"),
                }
                if (*span).size_class != 0 {
                    report.small_spans += 1;
                }
            }
        });
        assert!(listed.is_empty(), "{} listed spans are not in use", listed.len());
        drop(guards);

        report.free_spans = pages.free_spans;
        report.inuse_pages = pages.inuse_pages;
        report.free_pages = pages.free_pages;
        report.released_pages = pages.released_pages;
        report
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("sweep_generation", &self.sweep_generation())
            .finish_non_exhaustive()
    }
}
