//! OS memory provider interface.
//!
//! The heap talks to the operating system only through [`MemoryProvider`]:
//! it reserves its arena and page map once, commits pages as the arena
//! grows, decommits free pages when scavenging and releases everything on
//! drop. Tests substitute providers that refuse to commit past a budget.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Source of page-aligned address space.
///
/// All lengths and addresses passed to `commit`, `decommit` and `release`
/// are multiples of the heap page size and lie in a range returned by
/// `reserve`.
pub trait MemoryProvider: Send + Sync {
    /// Reserves `len` bytes of address space, preferably at `hint`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when no address space is available.
    fn reserve(&self, hint: usize, len: usize) -> io::Result<NonNull<u8>>;

    /// Backs `[ptr, ptr + len)` with readable, writable memory.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the range cannot be committed.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live reservation.
    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the physical memory behind `[ptr, ptr + len)`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the range cannot be decommitted.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live reservation and hold no live data.
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Releases a whole reservation.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly a range returned by `reserve`.
    unsafe fn release(&self, ptr: NonNull<u8>, len: usize);
}

/// The operating system's virtual memory, via `sys_alloc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl MemoryProvider for SystemMemory {
    fn reserve(&self, hint: usize, len: usize) -> io::Result<NonNull<u8>> {
        let region = sys_alloc::ReserveOptions::new()
            .len(len)
            .with_hint(hint)
            .reserve()?;
        Ok(region.into_raw().0)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { sys_alloc::commit(ptr, len) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { sys_alloc::decommit(ptr, len) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: forwarded from the caller.
        drop(unsafe { sys_alloc::Reservation::from_raw(ptr, len) });
    }
}

impl<P: MemoryProvider + ?Sized> MemoryProvider for Arc<P> {
    fn reserve(&self, hint: usize, len: usize) -> io::Result<NonNull<u8>> {
        (**self).reserve(hint, len)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { (**self).commit(ptr, len) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { (**self).decommit(ptr, len) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        unsafe { (**self).release(ptr, len) }
    }
}

/// A region obtained from a provider, released on drop.
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    provider: Arc<dyn MemoryProvider>,
}

impl Region {
    pub(crate) fn reserve(
        provider: &Arc<dyn MemoryProvider>,
        hint: usize,
        len: usize,
    ) -> io::Result<Self> {
        let base = provider.reserve(hint, len)?;
        Ok(Self {
            base,
            len,
            provider: Arc::clone(provider),
        })
    }

    pub(crate) const fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn provider(&self) -> &dyn MemoryProvider {
        &*self.provider
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` is exactly what `reserve` returned.
        unsafe { self.provider.release(self.base, self.len) };
    }
}

// SAFETY: the region is plain address space; access is synchronized by its owner.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}
