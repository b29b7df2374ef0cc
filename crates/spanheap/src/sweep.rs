//! Coordination with an external sweeper.
//!
//! The heap keeps a sweep generation `sg` that advances by 2 per collection
//! cycle. Every span carries a [`SweepStamp`] relative to it:
//!
//! | stamp    | meaning                         |
//! |----------|---------------------------------|
//! | `sg - 2` | needs sweeping                  |
//! | `sg - 1` | being swept by exactly one actor |
//! | `sg`     | swept, ready for allocation     |
//!
//! Moving from `sg - 2` to `sg - 1` is a single compare-and-swap, so of all
//! actors racing for a span (central refills, `Heap::sweep_all`) exactly one
//! wins and runs the [`Sweeper`]. The winner stores `sg` once the reclaimed
//! slots are back on the span's free list.
//!
//! The claim also raises a `sweeping` flag that only the winner clears. The
//! generation may advance while a sweep is in flight, after which the stamp
//! alone no longer reads as "being swept"; the flag still does.

use std::ptr::NonNull;

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::span::{poison_slot, FreeChain, LiveBits, Span};

/// Where a span stands relative to the current sweep generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    /// Not swept in this cycle yet.
    NeedsSweep,
    /// Claimed by a sweeper that has not finished.
    Sweeping,
    /// Swept in this cycle (or allocated during it).
    Swept,
}

/// Per-span sweep generation stamp.
#[derive(Debug)]
pub struct SweepStamp {
    generation: AtomicU32,
    sweeping: AtomicBool,
}

impl SweepStamp {
    /// Creates a stamp at `generation`.
    #[must_use]
    pub fn new(generation: u32) -> Self {
        Self {
            generation: AtomicU32::new(generation),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Current stamp.
    #[must_use]
    pub fn load(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Overwrites the stamp. Only used for spans nobody else can see yet.
    pub fn store(&self, generation: u32) {
        self.sweeping.store(false, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Release);
    }

    /// Returns `true` between a successful claim and its `finish`, whatever
    /// the generation has advanced to meanwhile.
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Classifies the stamp against heap generation `sg`.
    #[must_use]
    pub fn status(&self, sg: u32) -> SweepStatus {
        if self.is_sweeping() {
            return SweepStatus::Sweeping;
        }
        if self.load() == sg.wrapping_sub(2) {
            SweepStatus::NeedsSweep
        } else {
            SweepStatus::Swept
        }
    }

    /// Claims the span for sweeping in generation `sg`.
    ///
    /// Returns `true` for exactly one caller per cycle. Never succeeds while
    /// an earlier claim is unfinished.
    pub fn try_claim(&self, sg: u32) -> bool {
        if self.is_sweeping() {
            return false;
        }
        let claimed = self
            .generation
            .compare_exchange(
                sg.wrapping_sub(2),
                sg.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if claimed {
            self.sweeping.store(true, Ordering::Release);
        }
        claimed
    }

    /// Marks the span swept in generation `sg`.
    ///
    /// Must come after every list change the sweep caused: a span stamped
    /// `sg` may be cached by any thread. If the heap advanced past `sg`
    /// meanwhile, the span reads as needing a sweep in the new cycle.
    pub fn finish(&self, sg: u32) {
        self.generation.store(sg, Ordering::Release);
        self.sweeping.store(false, Ordering::Release);
    }
}

/// Opaque per-span scanning descriptor, set by the embedder with
/// [`Heap::set_scan_descriptor`](crate::Heap::set_scan_descriptor) and
/// handed back to the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ScanDescriptor(pub usize);

/// An external reclaimer for spans that need sweeping.
///
/// The sweeper must only reclaim objects the program will never use or free
/// explicitly again.
pub trait Sweeper: Send + Sync {
    /// Reclaims dead objects of `span` and returns how many it reclaimed.
    fn try_sweep(&self, span: &mut SweepSpan<'_>) -> usize;
}

impl<S: Sweeper + ?Sized> Sweeper for std::sync::Arc<S> {
    fn try_sweep(&self, span: &mut SweepSpan<'_>) -> usize {
        (**self).try_sweep(span)
    }
}

/// A sweeper that never reclaims anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSweeper;

impl Sweeper for NoopSweeper {
    fn try_sweep(&self, _span: &mut SweepSpan<'_>) -> usize {
        0
    }
}

/// A claimed span, as seen by a [`Sweeper`].
///
/// Which slots are allocated is a snapshot taken when the span was claimed:
/// slots in a caller's hands at that point. The span's free list is not
/// touched until the sweep returns.
pub struct SweepSpan<'a> {
    base: usize,
    object_size: usize,
    size_class: usize,
    generation: u32,
    descriptor: ScanDescriptor,
    free: Vec<bool>,
    magic: crate::size_class::DivMagic,
    reclaimed: FreeChain,
    live: &'a LiveBits,
}

impl SweepSpan<'_> {
    /// Builds the view of a span claimed for generation `sg`.
    ///
    /// # Safety
    ///
    /// The caller must hold the claim and own the span's free list.
    pub(crate) unsafe fn new(span: *mut Span, sg: u32) -> Self {
        let (base, objects, object_size, size_class, magic) = unsafe {
            (
                (*span).start,
                (*span).objects,
                (*span).elem_size,
                (*span).size_class,
                (*span).magic,
            )
        };
        let live = unsafe { &(*span).live };
        let free = (0..objects).map(|i| !live.is_set(i)).collect();
        Self {
            base,
            object_size,
            size_class,
            generation: sg,
            descriptor: ScanDescriptor(unsafe { Span::descriptor(span) }),
            free,
            magic,
            reclaimed: FreeChain::new(),
            live,
        }
    }

    /// Size class of the span.
    #[must_use]
    pub const fn size_class(&self) -> usize {
        self.size_class
    }

    /// Slot size in bytes.
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Address of the first slot.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        NonNull::new(self.base as *mut u8).unwrap_or(NonNull::dangling())
    }

    /// Number of slots in the span.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.len()
    }

    /// Generation the span is being swept for.
    #[must_use]
    pub const fn sweep_generation(&self) -> u32 {
        self.generation
    }

    /// The span's scanning descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> ScanDescriptor {
        self.descriptor
    }

    /// Number of slots reclaimed so far.
    #[must_use]
    pub const fn reclaimed(&self) -> usize {
        self.reclaimed.len()
    }

    fn slot_of(&self, obj: NonNull<u8>) -> Option<usize> {
        let offset = (obj.as_ptr() as usize).checked_sub(self.base)?;
        let index = self.magic.slot_index(offset);
        (index < self.free.len() && index * self.object_size == offset).then_some(index)
    }

    /// Returns `true` if `obj` is the start of an allocated slot.
    #[must_use]
    pub fn is_allocated(&self, obj: NonNull<u8>) -> bool {
        self.slot_of(obj).is_some_and(|i| !self.free[i])
    }

    /// Iterates over the allocated slots.
    pub fn allocated(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.free
            .iter()
            .enumerate()
            .filter(|(_, free)| !**free)
            .filter_map(|(i, _)| NonNull::new((self.base + i * self.object_size) as *mut u8))
    }

    /// Reclaims one allocated slot.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not the start of an allocated slot of this span,
    /// or if it was freed explicitly since the snapshot.
    ///
    /// # Safety
    ///
    /// The object must be dead: nothing may read, write or free it again.
    pub unsafe fn reclaim(&mut self, obj: NonNull<u8>) {
        let Some(index) = self.slot_of(obj) else {
            panic!("reclaim of {obj:p}: not a slot of span at {:#x}", self.base);
        };
        assert!(!self.free[index], "reclaim of {obj:p}: slot is already free");
        assert!(self.live.clear(index), "reclaim of {obj:p}: freed explicitly during the sweep");
        self.free[index] = true;
        unsafe {
            poison_slot(obj, self.object_size);
            self.reclaimed.push(obj);
        }
    }

    /// Reclaims every allocated slot for which `keep` returns `false`.
    ///
    /// Returns the number of slots reclaimed by this call.
    ///
    /// # Safety
    ///
    /// As for [`SweepSpan::reclaim`], for every rejected slot.
    pub unsafe fn retain(&mut self, mut keep: impl FnMut(NonNull<u8>) -> bool) -> usize {
        let dead: Vec<NonNull<u8>> = self.allocated().filter(|obj| !keep(*obj)).collect();
        for obj in &dead {
            unsafe { self.reclaim(*obj) };
        }
        dead.len()
    }

    pub(crate) fn into_reclaimed(self) -> FreeChain {
        self.reclaimed
    }
}
