//! Per-thread allocation front end.
//!
//! A [`ThreadCache`] holds one span per size class and allocates from it
//! without locking. Freed objects whose span the cache does not hold wait on
//! a per-class list and are handed out again first; past a high-water mark
//! half of the list goes back to the central free list.
//!
//! Pointer-free requests under 16 bytes are packed into a shared 16-byte
//! block (the tiny allocator). Tiny objects cannot be freed individually;
//! only the sweeper reclaims their block.

use std::ops::{BitOr, BitOrAssign};
use std::ptr::{self, NonNull};

use crate::error::AllocError;
use crate::heap::Heap;
use crate::metrics::LocalStats;
use crate::size_class::{size_classes, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, TINY_SIZE, TINY_SIZE_CLASS};
use crate::span::{clear_slot, poison_slot, FreeChain, Span};

/// Options for one allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// Zeroed memory that may hold pointers.
    pub const NONE: Self = Self(0);
    /// The object holds no pointers. Enables tiny packing for small sizes.
    pub const NO_SCAN: Self = Self(1);
    /// The caller overwrites the object; skip zeroing.
    pub const NO_ZERO: Self = Self(1 << 1);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

struct ClassCache {
    /// Span held exclusively by this cache, or null.
    span: *mut Span,
    /// Freed objects of other spans, reused before the span.
    freed: FreeChain,
    /// Length of `freed` that triggers a release to the central list.
    limit: usize,
}

/// A thread's handle for allocating from a [`Heap`].
///
/// A cache is `Send` but not `Sync`: it may move between threads, but only
/// one thread uses it at a time. Dropping it returns everything it holds to
/// the heap.
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
/// let mut cache = heap.thread_cache();
///
/// let p = cache.allocate(24, AllocFlags::NONE).unwrap();
/// assert_eq!(heap.usable_size(p), Some(32));
/// unsafe { cache.free(p) };
/// ```
pub struct ThreadCache<'h> {
    heap: &'h Heap,
    classes: Box<[ClassCache]>,
    tiny: *mut u8,
    tiny_offset: usize,
    /// Bytes on all `freed` lists.
    cached_bytes: usize,
    stats: LocalStats,
}

// SAFETY: the cache's spans and lists are reachable only through `&mut self`.
unsafe impl Send for ThreadCache<'_> {}

impl<'h> ThreadCache<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        let classes = size_classes();
        Self {
            heap,
            classes: (0..NUM_SIZE_CLASSES)
                .map(|id| ClassCache {
                    span: ptr::null_mut(),
                    freed: FreeChain::new(),
                    limit: if id == 0 {
                        0
                    } else {
                        heap.config().cache_limit(classes.class_size(id))
                    },
                })
                .collect(),
            tiny: ptr::null_mut(),
            tiny_offset: 0,
            cached_bytes: 0,
            stats: LocalStats::new(),
        }
    }

    /// The heap this cache allocates from.
    #[must_use]
    pub const fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Allocates `size` bytes, aligned to at least 8 bytes (tiny objects: to
    /// the alignment their size implies).
    ///
    /// A zero-size request returns a shared sentinel address. Running out
    /// of memory aborts the process.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidRequest`] if `size` exceeds the arena.
    pub fn allocate(&mut self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
        match self.try_allocate(size, flags) {
            Err(AllocError::OutOfMemory { requested }) => Heap::out_of_memory(requested),
            result => result,
        }
    }

    /// Like [`ThreadCache::allocate`], but reports running out of memory
    /// instead of aborting.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidRequest`] if `size` exceeds the arena,
    /// [`AllocError::OutOfMemory`] if the memory provider refuses.
    pub fn try_allocate(&mut self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Ok(Heap::zero_sized());
        }
        if size > self.heap.config().arena_bytes {
            return Err(AllocError::InvalidRequest { size });
        }
        if size > MAX_SMALL_SIZE {
            return self.heap.allocate_large(size, flags);
        }
        if flags.contains(AllocFlags::NO_SCAN) && size < TINY_SIZE {
            return self.allocate_tiny(size);
        }

        let class = size_classes().classify(size);
        let obj = self.next_free(class)?;
        if !flags.contains(AllocFlags::NO_ZERO) {
            // SAFETY: the slot just left a free list and is ours.
            unsafe { clear_slot(obj, size_classes().class_size(class)) };
        }
        Ok(obj)
    }

    /// Allocates an array of `count` elements of `elem_size` bytes.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidRequest`] if the total size overflows or
    /// exceeds the arena.
    pub fn allocate_array(
        &mut self,
        elem_size: usize,
        count: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        let size = elem_size
            .checked_mul(count)
            .ok_or(AllocError::InvalidRequest { size: usize::MAX })?;
        self.allocate(size, flags)
    }

    fn allocate_tiny(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut offset = self.tiny_offset;
        if size & 7 == 0 {
            offset = offset.next_multiple_of(8);
        } else if size & 3 == 0 {
            offset = offset.next_multiple_of(4);
        } else if size & 1 == 0 {
            offset = offset.next_multiple_of(2);
        }
        self.stats.tiny_allocs += 1;

        if let Some(block) = NonNull::new(self.tiny) {
            if offset + size <= TINY_SIZE {
                self.tiny_offset = offset + size;
                // SAFETY: the block is TINY_SIZE bytes and `offset` stays inside.
                return Ok(unsafe { block.add(offset) });
            }
        }

        let block = self.next_free(TINY_SIZE_CLASS)?;
        // SAFETY: a fresh 16-byte slot owned by us.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, TINY_SIZE) };
        // Keep whichever block has more room left.
        if self.tiny.is_null() || size < self.tiny_offset {
            self.tiny = block.as_ptr();
            self.tiny_offset = size;
        }
        Ok(block)
    }

    #[inline]
    fn next_free(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
        let cache = &mut self.classes[class];
        let obj = if let Some(obj) = cache.freed.pop() {
            self.cached_bytes -= size_classes().class_size(class);
            let Some(span) = self.heap.pages.span_of(obj) else {
                panic!("corrupted free list: {obj:p} is not in an in-use span");
            };
            // SAFETY: freed objects keep their span in use.
            unsafe { Span::mark_live(span, obj) };
            obj
        } else if let Some(obj) = NonNull::new(cache.span).and_then(|span| {
            // SAFETY: the span is cached by us; we own its free list.
            unsafe { Span::pop_free(span.as_ptr()) }
        }) {
            obj
        } else {
            self.refill(class)?
        };
        self.stats.mallocs[class] += 1;
        Ok(obj)
    }

    /// Swaps the class's exhausted span for one with free slots.
    #[cold]
    #[inline(never)]
    fn refill(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
        let heap = self.heap;
        heap.counters.purge(&mut self.stats);

        let central = heap.central(class);
        let old = std::mem::replace(&mut self.classes[class].span, ptr::null_mut());
        if !old.is_null() {
            // SAFETY: `old` was cached by us and we give it up.
            unsafe { central.uncache_span(heap, old) };
        }

        let span = central.cache_span(heap)?;
        self.classes[class].span = span;
        // SAFETY: a freshly cached span has at least one free slot.
        match unsafe { Span::pop_free(span) } {
            Some(obj) => Ok(obj),
            None => panic!("central list of class {class} handed out a full span"),
        }
    }

    /// Frees an object allocated from this cache's heap by any thread.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of a live object of the heap; a
    /// second free of a small object is caught this way.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an allocation on this heap that is not used
    /// again, and must not be a tiny object.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if ptr == Heap::zero_sized() {
            return;
        }
        let Some(span) = self.heap.pages.span_of(ptr) else {
            panic!("free of {ptr:p}: not an allocation of this heap");
        };
        // SAFETY: in-use spans keep their class while any object is live.
        if unsafe { (*span).size_class } == 0 {
            unsafe { self.heap.free_large(span, ptr) };
        } else {
            unsafe { self.free_small_in(span, ptr) };
        }
    }

    /// Frees a small object whose size class the caller knows.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of a live object of class `class`.
    ///
    /// # Safety
    ///
    /// As for [`ThreadCache::free`].
    pub unsafe fn free_small(&mut self, ptr: NonNull<u8>, class: usize) {
        let Some(span) = self.heap.pages.span_of(ptr) else {
            panic!("free of {ptr:p}: not an allocation of this heap");
        };
        let actual = unsafe { (*span).size_class };
        assert_eq!(actual, class, "free of {ptr:p} as class {class}, but it is class {actual}");
        unsafe { self.free_small_in(span, ptr) };
    }

    unsafe fn free_small_in(&mut self, span: *mut Span, ptr: NonNull<u8>) {
        let (class, size) = unsafe { ((*span).size_class, (*span).elem_size) };
        unsafe { Span::mark_dead(span, ptr) };
        unsafe { poison_slot(ptr, size) };
        self.stats.frees[class] += 1;

        let cache = &mut self.classes[class];
        if cache.span == span {
            // SAFETY: cached by us.
            unsafe { Span::push_free(span, ptr) };
            return;
        }

        unsafe { cache.freed.push(ptr) };
        self.cached_bytes += size;
        if cache.freed.len() > cache.limit {
            self.release_half(class);
        }
        if self.cached_bytes > self.heap.config().cache_total_bytes {
            self.scavenge();
        }
    }

    /// Returns half of a class's freed list to the central list.
    fn release_half(&mut self, class: usize) {
        let count = self.classes[class].freed.len() / 2;
        self.release(class, count);
    }

    /// Returns `count` objects of a class's freed list to the central list.
    fn release(&mut self, class: usize, count: usize) {
        let chain = self.classes[class].freed.split_off(count);
        if chain.is_empty() {
            return;
        }
        self.cached_bytes -= chain.len() * size_classes().class_size(class);
        // SAFETY: the objects were freed by their owners and only we hold them.
        unsafe { self.heap.central(class).release_objects(self.heap, chain) };
    }

    /// Shrinks the freed lists until they hold half the per-thread bound.
    fn scavenge(&mut self) {
        let target = self.heap.config().cache_total_bytes / 2;
        for class in 1..NUM_SIZE_CLASSES {
            if self.cached_bytes <= target {
                break;
            }
            // Rounds up so lone objects go back too.
            let count = self.classes[class].freed.len().div_ceil(2);
            self.release(class, count);
        }
    }

    /// Returns every cached span and freed object to the central lists.
    ///
    /// Required before [`Heap::advance_sweep_generation`] so that no span
    /// stays cached across a sweep cycle.
    pub fn flush(&mut self) {
        let heap = self.heap;
        for class in 1..NUM_SIZE_CLASSES {
            let central = heap.central(class);
            let span = std::mem::replace(&mut self.classes[class].span, ptr::null_mut());
            if !span.is_null() {
                // SAFETY: cached by us; we give it up.
                unsafe { central.uncache_span(heap, span) };
            }
            let freed = self.classes[class].freed.take();
            // SAFETY: as in `release_half`.
            unsafe { central.release_objects(heap, freed) };
        }
        self.tiny = ptr::null_mut();
        self.tiny_offset = 0;
        self.cached_bytes = 0;
        heap.counters.purge(&mut self.stats);
    }

    /// Bytes of freed objects this cache holds for reuse.
    #[must_use]
    pub const fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }
}

impl Drop for ThreadCache<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for ThreadCache<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("cached_bytes", &self.cached_bytes)
            .field("tiny_offset", &self.tiny_offset)
            .finish_non_exhaustive()
    }
}
