//! Page-granular virtual memory primitives.
//!
//! Address space is handled in two steps: a region is first *reserved*
//! (inaccessible, no physical backing) and then ranges inside it are
//! *committed* on demand. Committed ranges can later be *decommitted*,
//! handing the physical pages back while keeping the address range, and the
//! whole reservation is *released* at the end.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// When requesting a specific address, it should be aligned to this granularity.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Makes `[ptr, ptr + len)` readable and writable.
///
/// # Errors
///
/// Returns the OS error if the pages cannot be backed.
///
/// # Safety
///
/// The range must lie inside a live reservation and be page-aligned.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::commit(ptr.as_ptr(), len) }
}

/// Returns the physical pages behind `[ptr, ptr + len)` to the system.
///
/// The range stays reserved; a later [`commit`] makes it usable again and it
/// reads as zero.
///
/// # Errors
///
/// Returns the OS error if the pages cannot be decommitted.
///
/// # Safety
///
/// The range must lie inside a live reservation, be page-aligned and hold
/// nothing the caller still needs.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::decommit(ptr.as_ptr(), len) }
}

/// Releases a whole reservation.
///
/// # Errors
///
/// Returns the OS error if the region cannot be unmapped.
///
/// # Safety
///
/// `ptr` and `len` must describe exactly one region obtained from
/// [`ReserveOptions::reserve`] (directly or through
/// [`Reservation::into_raw`]) and nothing may touch it afterwards.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::release(ptr.as_ptr(), len) }
}

/// A reserved range of address space.
///
/// The range is released when this handle is dropped, unless ownership was
/// handed out with [`Reservation::into_raw`].
#[derive(Debug)]
pub struct Reservation {
    ptr: NonNull<u8>,
    len: usize,
}

impl Reservation {
    /// Returns a pointer to the start of the reservation.
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the length of the reservation in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the reservation is empty (never the case for a
    /// reservation produced by [`ReserveOptions::reserve`]).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commits `len` bytes starting `offset` bytes into the reservation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range leaves the reservation, or the OS
    /// error if it cannot be backed.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be multiples of [`page_size`].
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = self.range(offset, len)?;
        unsafe { commit(start, len) }
    }

    /// Decommits `len` bytes starting `offset` bytes into the reservation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range leaves the reservation, or the OS
    /// error from the decommit.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be multiples of [`page_size`], and nothing may
    /// read the range until it is committed again.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = self.range(offset, len)?;
        unsafe { decommit(start, len) }
    }

    /// Gives up ownership of the range without releasing it.
    ///
    /// The caller becomes responsible for calling [`release`].
    #[must_use]
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.ptr, self.len);
        std::mem::forget(self);
        raw
    }

    /// Takes back ownership of a range produced by [`Reservation::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must come from `into_raw` and must not be owned by
    /// anything else.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    fn range(&self, offset: usize, len: usize) -> io::Result<NonNull<u8>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {
                // SAFETY: offset is inside the reservation.
                Ok(unsafe { self.ptr.add(offset) })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside of reservation",
            )),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: we own the reservation.
        let _ = unsafe { release(self.ptr, self.len) };
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Configuration for reserving address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    hint_addr: usize,
    commit: bool,
}

impl ReserveOptions {
    /// Creates a new `ReserveOptions` with default settings (length 0).
    /// You must set a length before reserving.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            commit: false,
        }
    }

    /// Sets the length of the reservation in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the reservation.
    ///
    /// The OS is free to ignore it. For the best chance of success the
    /// address should be aligned to [`allocation_granularity`] and the range
    /// `[hint_addr, hint_addr + len)` should be unused.
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Commits the whole range immediately after reserving it.
    #[must_use]
    pub const fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Reserves the address range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error if the
    /// range cannot be reserved or committed.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: reserving without MAP_FIXED cannot clobber existing mappings.
        let ptr = unsafe { os::reserve(self.hint_addr, self.len)? };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reservation returned null"))?;
        let reservation = Reservation { ptr, len: self.len };

        if self.commit {
            // SAFETY: the whole reservation is ours.
            unsafe { reservation.commit(0, self.len)? };
        }
        Ok(reservation)
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}
