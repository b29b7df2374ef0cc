//! Span records and the intrusive lists that hold them.
//!
//! A span is a run of pages. Small-object spans are chopped into equal
//! slots; free slots are chained through their first word. Large-object
//! spans hold exactly one object.
//!
//! Span records are only ever reached through raw pointers. Which thread may
//! touch which field is decided by where the span currently lives:
//!
//! - `HeapFree`: the page-heap lock.
//! - `Nonempty` / `Empty`: the central lock of its class.
//! - `Cached`: the owning thread cache for `freelist` and `allocated`; the
//!   central lock for `residence` and `deferred`.
//! - `Large`: the owner of the object.
//!
//! `state`, `sweep`, `descriptor` and `live` are atomic and may be read by
//! anyone. A `live` bit is set while its slot is in a caller's hands; the
//! free that clears it may come from any thread.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::size_class::{DivMagic, MAX_SPAN_OBJECTS, PAGE_SHIFT};
use crate::sweep::SweepStamp;

/// Written to the second word of freed slots larger than two words.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const POISON: usize = 0xdead_dead_dead_dead_u64 as usize;

const WORD: usize = std::mem::size_of::<usize>();

/// A free slot; its first word links to the next one.
#[repr(C)]
pub(crate) struct FreeSlot {
    next: *mut FreeSlot,
}

/// Which container a span is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Residence {
    /// In no container (being moved or freshly carved).
    Unlinked,
    /// On a page-heap free-run list.
    HeapFree,
    /// On a central `nonempty` list.
    Nonempty,
    /// On a central `empty` list.
    Empty,
    /// Held exclusively by a thread cache.
    Cached,
    /// Backing one large object.
    Large,
}

/// Lifecycle state of a span record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpanState {
    /// The record is unused and sits in the record pool.
    Dead = 0,
    /// The pages are free in the page heap.
    Free = 1,
    /// The pages back small slots or a large object.
    InUse = 2,
}

impl SpanState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Free,
            2 => Self::InUse,
            _ => Self::Dead,
        }
    }
}

/// A singly linked chain of free slots with O(1) append.
pub(crate) struct FreeChain {
    head: *mut FreeSlot,
    tail: *mut FreeSlot,
    len: usize,
}

impl FreeChain {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// `obj` must be a slot the caller owns, at least one word wide.
    pub(crate) unsafe fn push(&mut self, obj: NonNull<u8>) {
        let slot = obj.as_ptr().cast::<FreeSlot>();
        unsafe { (*slot).next = self.head };
        if self.head.is_null() {
            self.tail = slot;
        }
        self.head = slot;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = NonNull::new(self.head)?;
        // SAFETY: every slot in the chain is owned by the chain.
        self.head = unsafe { (*slot.as_ptr()).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        Some(slot.cast())
    }

    pub(crate) fn append(&mut self, other: Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        // SAFETY: tail is a live slot of this chain.
        unsafe { (*self.tail).next = other.head };
        self.tail = other.tail;
        self.len += other.len;
    }

    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::new())
    }

    /// Moves up to `count` slots into a new chain.
    pub(crate) fn split_off(&mut self, count: usize) -> Self {
        let mut out = Self::new();
        for _ in 0..count {
            let Some(obj) = self.pop() else { break };
            // SAFETY: `obj` just left this chain.
            unsafe { out.push(obj) };
        }
        out
    }
}

const LIVE_WORDS: usize = MAX_SPAN_OBJECTS / 64;

/// One bit per slot of a small-object span.
pub(crate) struct LiveBits([AtomicU64; LIVE_WORDS]);

impl LiveBits {
    const fn new() -> Self {
        Self([const { AtomicU64::new(0) }; LIVE_WORDS])
    }

    const fn locate(index: usize) -> (usize, u64) {
        (index / 64, 1 << (index % 64))
    }

    /// Sets the bit of slot `index`; returns whether it was already set.
    pub(crate) fn set(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.0[word].fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Clears the bit of slot `index`; returns whether it was set.
    pub(crate) fn clear(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.0[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.0[word].load(Ordering::Acquire) & bit != 0
    }

    fn reset(&self) {
        for word in &self.0 {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Writes the free-slot marker into a slot that is about to be freed.
///
/// # Safety
///
/// `obj` must point to a slot of `size` bytes owned by the caller.
pub(crate) unsafe fn poison_slot(obj: NonNull<u8>, size: usize) {
    let words = obj.as_ptr().cast::<usize>();
    if size > 2 * WORD {
        unsafe { words.add(1).write(POISON) };
    } else if size == 2 * WORD {
        unsafe { words.add(1).write(0) };
    }
}

/// Prepares a slot that just left a free list for its new owner.
///
/// Clears the link word, then the whole slot unless it is known to be zero
/// already (second word still zero from the span's fresh pages).
///
/// # Safety
///
/// `obj` must point to a slot of `size` bytes owned by the caller.
pub(crate) unsafe fn clear_slot(obj: NonNull<u8>, size: usize) {
    let words = obj.as_ptr().cast::<usize>();
    unsafe { words.write(0) };
    if size > 2 * WORD && unsafe { words.add(1).read() } != 0 {
        unsafe { ptr::write_bytes(obj.as_ptr(), 0, size) };
    }
}

/// A run of pages plus its allocation bookkeeping.
pub(crate) struct Span {
    pub(crate) next: *mut Span,
    pub(crate) prev: *mut Span,
    pub(crate) residence: Residence,
    /// First byte of the run.
    pub(crate) start: usize,
    pub(crate) npages: usize,
    pub(crate) freelist: *mut FreeSlot,
    /// Slots not on `freelist` (for large spans: 1).
    pub(crate) allocated: usize,
    /// 0 for large-object spans.
    pub(crate) size_class: usize,
    pub(crate) elem_size: usize,
    /// Slots carved from the span.
    pub(crate) objects: usize,
    /// End of the usable bytes.
    pub(crate) limit: usize,
    pub(crate) magic: DivMagic,
    pub(crate) needzero: bool,
    /// Pages of this free span decommitted by the scavenger.
    pub(crate) released: usize,
    /// Frees that arrived while another thread had the span cached.
    pub(crate) deferred: FreeChain,
    state: AtomicU8,
    pub(crate) sweep: SweepStamp,
    descriptor: AtomicUsize,
    pub(crate) live: LiveBits,
}

impl Span {
    pub(crate) fn dead() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            residence: Residence::Unlinked,
            start: 0,
            npages: 0,
            freelist: ptr::null_mut(),
            allocated: 0,
            size_class: 0,
            elem_size: 0,
            objects: 0,
            limit: 0,
            magic: DivMagic::default(),
            needzero: false,
            released: 0,
            deferred: FreeChain::new(),
            state: AtomicU8::new(SpanState::Dead as u8),
            sweep: SweepStamp::new(0),
            descriptor: AtomicUsize::new(0),
            live: LiveBits::new(),
        }
    }

    /// # Safety
    ///
    /// `span` must be a live record.
    pub(crate) unsafe fn state(span: *const Self) -> SpanState {
        SpanState::from_u8(unsafe { (*span).state.load(Ordering::Acquire) })
    }

    /// # Safety
    ///
    /// `span` must be a live record owned by the caller.
    pub(crate) unsafe fn set_state(span: *mut Self, state: SpanState) {
        unsafe { (*span).state.store(state as u8, Ordering::Release) };
    }

    /// # Safety
    ///
    /// `span` must be a live record.
    pub(crate) unsafe fn descriptor(span: *const Self) -> usize {
        unsafe { (*span).descriptor.load(Ordering::Acquire) }
    }

    /// # Safety
    ///
    /// `span` must be a live record.
    pub(crate) unsafe fn set_descriptor(span: *const Self, value: usize) {
        unsafe { (*span).descriptor.store(value, Ordering::Release) };
    }

    /// # Safety
    ///
    /// `span` must be a live record.
    pub(crate) unsafe fn end(span: *const Self) -> usize {
        unsafe { (*span).start + ((*span).npages << PAGE_SHIFT) }
    }

    /// Index of the slot starting exactly at `addr`, if any.
    ///
    /// # Safety
    ///
    /// `span` must be a live small-object record.
    pub(crate) unsafe fn slot_index(span: *const Self, addr: usize) -> Option<usize> {
        let (start, objects, elem_size, magic) =
            unsafe { ((*span).start, (*span).objects, (*span).elem_size, (*span).magic) };
        let offset = addr.checked_sub(start)?;
        let index = magic.slot_index(offset);
        (index < objects && index * elem_size == offset).then_some(index)
    }

    /// Chains every slot into the free list, lowest address first.
    ///
    /// # Safety
    ///
    /// `span` must be a freshly allocated small-object span owned by the caller.
    pub(crate) unsafe fn carve(span: *mut Self) {
        unsafe {
            let mut head: *mut FreeSlot = ptr::null_mut();
            for i in (0..(*span).objects).rev() {
                let slot = ((*span).start + i * (*span).elem_size) as *mut FreeSlot;
                (*slot).next = head;
                head = slot;
            }
            (*span).freelist = head;
            (*span).allocated = 0;
            (*span).live.reset();
        }
    }

    /// Records that `obj` was handed to a caller.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a slot of the span or is live already.
    ///
    /// # Safety
    ///
    /// `span` must be a live small-object record.
    pub(crate) unsafe fn mark_live(span: *const Self, obj: NonNull<u8>) {
        let Some(index) = (unsafe { Self::slot_index(span, obj.as_ptr() as usize) }) else {
            panic!("corrupted free list: {obj:p} is not a slot");
        };
        assert!(
            !unsafe { (*span).live.set(index) },
            "corrupted free list: {obj:p} handed out twice"
        );
    }

    /// Records that the caller gave `obj` back.
    ///
    /// # Panics
    ///
    /// Panics on a double free.
    ///
    /// # Safety
    ///
    /// As for [`Span::mark_live`]; `obj` must be a slot of the span.
    pub(crate) unsafe fn mark_dead(span: *const Self, obj: NonNull<u8>) {
        let Some(index) = (unsafe { Self::slot_index(span, obj.as_ptr() as usize) }) else {
            panic!("free of {obj:p}: not the start of a slot");
        };
        assert!(unsafe { (*span).live.clear(index) }, "double free of {obj:p}");
    }

    /// Takes one slot from the free list and marks it live.
    ///
    /// # Safety
    ///
    /// The caller must own the span's free list (cached, or central lock held).
    #[inline]
    pub(crate) unsafe fn pop_free(span: *mut Self) -> Option<NonNull<u8>> {
        unsafe {
            let slot = NonNull::new((*span).freelist)?;
            (*span).freelist = (*slot.as_ptr()).next;
            (*span).allocated += 1;
            Self::mark_live(span, slot.cast());
            Some(slot.cast())
        }
    }

    /// Returns one slot to the free list.
    ///
    /// # Safety
    ///
    /// As for [`Span::pop_free`]; `obj` must be an allocated slot of this span.
    #[inline]
    pub(crate) unsafe fn push_free(span: *mut Self, obj: NonNull<u8>) {
        unsafe {
            assert!(
                (*span).allocated > 0,
                "free of {obj:p}: span at {:#x} has no allocated slots",
                (*span).start
            );
            let slot = obj.as_ptr().cast::<FreeSlot>();
            (*slot).next = (*span).freelist;
            (*span).freelist = slot;
            (*span).allocated -= 1;
        }
    }

    /// Prepends a chain of this span's slots to its free list.
    ///
    /// # Safety
    ///
    /// As for [`Span::pop_free`]; every slot in `chain` must be an allocated
    /// slot of this span.
    pub(crate) unsafe fn splice(span: *mut Self, chain: FreeChain) {
        if chain.is_empty() {
            return;
        }
        unsafe {
            assert!(
                chain.len <= (*span).allocated,
                "span at {:#x}: freeing {} slots but only {} are allocated",
                (*span).start,
                chain.len,
                (*span).allocated
            );
            (*chain.tail).next = (*span).freelist;
            (*span).freelist = chain.head;
            (*span).allocated -= chain.len;
        }
    }

    /// Walks the free list, returning its length.
    ///
    /// # Panics
    ///
    /// Panics if the list holds a slot outside the span or more entries than
    /// the span has slots (a cycle).
    ///
    /// # Safety
    ///
    /// The caller must own the span's free list.
    pub(crate) unsafe fn count_free(span: *const Self) -> usize {
        let mut n = 0;
        let mut slot = unsafe { (*span).freelist };
        while !slot.is_null() {
            assert!(
                unsafe { Self::slot_index(span, slot as usize) }.is_some(),
                "corrupted free list: {slot:p} is not a slot of span at {:#x}",
                unsafe { (*span).start }
            );
            n += 1;
            assert!(
                n <= unsafe { (*span).objects },
                "corrupted free list: cycle in span at {:#x}",
                unsafe { (*span).start }
            );
            slot = unsafe { (*slot).next };
        }
        n
    }
}

/// Intrusive doubly linked list of spans.
///
/// Every list has a residence tag; pushing stamps it on the span and
/// removing checks it, so a span can never sit in two lists.
pub(crate) struct SpanList {
    first: *mut Span,
    last: *mut Span,
    len: usize,
    tag: Residence,
}

// SAFETY: the list is only touched under the lock that owns it.
unsafe impl Send for SpanList {}

impl SpanList {
    pub(crate) const fn new(tag: Residence) -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            len: 0,
            tag,
        }
    }

    pub(crate) const fn first(&self) -> *mut Span {
        self.first
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) const fn tag(&self) -> Residence {
        self.tag
    }

    unsafe fn claim(&self, span: *mut Span) {
        unsafe {
            assert!(
                (*span).residence == Residence::Unlinked,
                "span at {:#x} pushed to {:?} list while {:?}",
                (*span).start,
                self.tag,
                (*span).residence
            );
            (*span).residence = self.tag;
        }
    }

    /// # Safety
    ///
    /// `span` must be a live, unlinked record.
    pub(crate) unsafe fn push_front(&mut self, span: *mut Span) {
        unsafe { self.claim(span) };
        unsafe {
            (*span).prev = ptr::null_mut();
            (*span).next = self.first;
            if self.first.is_null() {
                self.last = span;
            } else {
                (*self.first).prev = span;
            }
        }
        self.first = span;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `span` must be a live, unlinked record.
    pub(crate) unsafe fn push_back(&mut self, span: *mut Span) {
        unsafe { self.claim(span) };
        unsafe {
            (*span).next = ptr::null_mut();
            (*span).prev = self.last;
            if self.last.is_null() {
                self.first = span;
            } else {
                (*self.last).next = span;
            }
        }
        self.last = span;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `span` must be a live record.
    ///
    /// # Panics
    ///
    /// Panics if the span is not on a list with this tag.
    pub(crate) unsafe fn remove(&mut self, span: *mut Span) {
        unsafe {
            assert!(
                (*span).residence == self.tag,
                "span at {:#x} removed from {:?} list while {:?}",
                (*span).start,
                self.tag,
                (*span).residence
            );
            let (prev, next) = ((*span).prev, (*span).next);
            if prev.is_null() {
                self.first = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.last = prev;
            } else {
                (*next).prev = prev;
            }
            (*span).next = ptr::null_mut();
            (*span).prev = ptr::null_mut();
            (*span).residence = Residence::Unlinked;
        }
        self.len -= 1;
    }

    pub(crate) const fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            next: self.first,
            _list: std::marker::PhantomData,
        }
    }
}

pub(crate) struct SpanIter<'a> {
    next: *mut Span,
    _list: std::marker::PhantomData<&'a SpanList>,
}

impl Iterator for SpanIter<'_> {
    type Item = *mut Span;

    fn next(&mut self) -> Option<*mut Span> {
        let span = self.next;
        if span.is_null() {
            return None;
        }
        // SAFETY: the list is borrowed, so its members stay linked.
        self.next = unsafe { (*span).next };
        Some(span)
    }
}
