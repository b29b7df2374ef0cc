//! Allocation statistics.
//!
//! Thread caches count locally and purge into the heap's shared counters on
//! refill, flush and drop, so a snapshot may lag behind the caches by the
//! counts they have not purged yet.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::size_class::{NUM_SIZE_CLASSES, PAGE_SHIFT};

/// Per-class counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Slot size of the class.
    pub size: usize,
    /// Objects handed out.
    pub mallocs: u64,
    /// Objects freed explicitly.
    pub frees: u64,
    /// Objects reclaimed by the sweeper.
    pub swept: u64,
}

impl ClassStats {
    /// Objects still live, as far as the purged counters know.
    #[must_use]
    pub const fn live(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees + self.swept)
    }

    /// Bytes handed out over the heap's lifetime.
    #[must_use]
    pub const fn malloc_bytes(&self) -> u64 {
        self.mallocs * self.size as u64
    }
}

/// A snapshot of heap-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Size of the reserved arena.
    pub arena_bytes: usize,
    /// Bytes currently committed for spans.
    pub system_bytes: usize,
    /// Times the arena grew.
    pub grows: u64,
    /// Pages of the arena handed to spans so far.
    pub used_pages: usize,
    /// Pages backing in-use spans.
    pub inuse_pages: usize,
    /// Pages in free spans.
    pub free_pages: usize,
    /// Free pages returned to the system.
    pub released_pages: usize,
    /// Bytes decommitted by scavenging, cumulative.
    pub scavenged_bytes: u64,
    /// Sub-16-byte objects packed into tiny blocks.
    pub tiny_allocs: u64,
    /// Large objects allocated.
    pub large_allocs: u64,
    /// Large objects freed.
    pub large_frees: u64,
    /// Bytes in live large objects.
    pub large_bytes: usize,
    /// Spans carved by central lists growing.
    pub spans_grown: u64,
    /// Small spans returned to the page heap.
    pub spans_released: u64,
    /// Spans handed to the sweeper.
    pub spans_swept: u64,
    /// Objects the sweeper reclaimed.
    pub objects_swept: u64,
    /// Per-class counters, indexed by class id (0 unused).
    pub classes: Vec<ClassStats>,
}

impl HeapStats {
    /// Bytes of the arena handed to spans so far.
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.used_pages << PAGE_SHIFT
    }

    /// Bytes in in-use spans.
    #[must_use]
    pub const fn inuse_bytes(&self) -> usize {
        self.inuse_pages << PAGE_SHIFT
    }

    /// Small objects handed out across all classes.
    #[must_use]
    pub fn mallocs(&self) -> u64 {
        self.classes.iter().map(|c| c.mallocs).sum()
    }

    /// Small objects freed explicitly across all classes.
    #[must_use]
    pub fn frees(&self) -> u64 {
        self.classes.iter().map(|c| c.frees).sum()
    }
}

#[derive(Debug, Default)]
struct ClassCounters {
    mallocs: AtomicU64,
    frees: AtomicU64,
    swept: AtomicU64,
}

/// Shared counters owned by the heap.
#[derive(Debug)]
pub(crate) struct HeapCounters {
    classes: Box<[ClassCounters]>,
    tiny_allocs: AtomicU64,
    large_allocs: AtomicU64,
    large_frees: AtomicU64,
    large_bytes: AtomicU64,
    spans_grown: AtomicU64,
    spans_released: AtomicU64,
    spans_swept: AtomicU64,
}

impl HeapCounters {
    pub(crate) fn new() -> Self {
        Self {
            classes: (0..NUM_SIZE_CLASSES).map(|_| ClassCounters::default()).collect(),
            tiny_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            large_bytes: AtomicU64::new(0),
            spans_grown: AtomicU64::new(0),
            spans_released: AtomicU64::new(0),
            spans_swept: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_large_alloc(&self, bytes: usize) {
        self.large_allocs.fetch_add(1, Ordering::Relaxed);
        self.large_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_large_free(&self, bytes: usize) {
        self.large_frees.fetch_add(1, Ordering::Relaxed);
        self.large_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_span_grown(&self) {
        self.spans_grown.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_span_released(&self) {
        self.spans_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, class: usize, reclaimed: usize) {
        self.spans_swept.fetch_add(1, Ordering::Relaxed);
        self.classes[class]
            .swept
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
    }

    /// Moves a thread cache's local counts into the shared counters.
    pub(crate) fn purge(&self, local: &mut LocalStats) {
        for (class, shared) in self.classes.iter().enumerate() {
            let mallocs = std::mem::take(&mut local.mallocs[class]);
            let frees = std::mem::take(&mut local.frees[class]);
            if mallocs != 0 {
                shared.mallocs.fetch_add(mallocs, Ordering::Relaxed);
            }
            if frees != 0 {
                shared.frees.fetch_add(frees, Ordering::Relaxed);
            }
        }
        let tiny = std::mem::take(&mut local.tiny_allocs);
        if tiny != 0 {
            self.tiny_allocs.fetch_add(tiny, Ordering::Relaxed);
        }
    }

    pub(crate) fn fill(&self, stats: &mut HeapStats, class_sizes: impl Fn(usize) -> usize) {
        stats.tiny_allocs = self.tiny_allocs.load(Ordering::Relaxed);
        stats.large_allocs = self.large_allocs.load(Ordering::Relaxed);
        stats.large_frees = self.large_frees.load(Ordering::Relaxed);
        stats.large_bytes = usize::try_from(self.large_bytes.load(Ordering::Relaxed)).unwrap_or(usize::MAX);
        stats.spans_grown = self.spans_grown.load(Ordering::Relaxed);
        stats.spans_released = self.spans_released.load(Ordering::Relaxed);
        stats.spans_swept = self.spans_swept.load(Ordering::Relaxed);
        stats.classes = self
            .classes
            .iter()
            .enumerate()
            .map(|(class, c)| ClassStats {
                size: class_sizes(class),
                mallocs: c.mallocs.load(Ordering::Relaxed),
                frees: c.frees.load(Ordering::Relaxed),
                swept: c.swept.load(Ordering::Relaxed),
            })
            .collect();
        stats.objects_swept = stats.classes.iter().map(|c| c.swept).sum();
    }
}

/// Counters private to one thread cache.
#[derive(Debug)]
pub(crate) struct LocalStats {
    pub(crate) mallocs: [u64; NUM_SIZE_CLASSES],
    pub(crate) frees: [u64; NUM_SIZE_CLASSES],
    pub(crate) tiny_allocs: u64,
}

impl LocalStats {
    pub(crate) const fn new() -> Self {
        Self {
            mallocs: [0; NUM_SIZE_CLASSES],
            frees: [0; NUM_SIZE_CLASSES],
            tiny_allocs: 0,
        }
    }
}
