use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Reserves `len` bytes of inaccessible address space, preferably at `hint_addr`.
///
/// # Safety
///
/// Calls `mmap`. The hint is advisory (no `MAP_FIXED`), so existing mappings
/// are never replaced.
pub unsafe fn reserve(hint_addr: usize, len: usize) -> io::Result<*mut u8> {
    let addr = if hint_addr == 0 {
        ptr::null_mut()
    } else {
        hint_addr as *mut libc::c_void
    };

    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(addr, len, libc::PROT_NONE, flags, -1, 0) };

    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr.cast::<u8>())
}

/// Makes `[ptr, ptr + len)` readable and writable.
///
/// # Safety
///
/// The range must lie inside a live reservation.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe {
        libc::mprotect(
            ptr.cast::<libc::c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Drops the physical backing of `[ptr, ptr + len)` and makes it inaccessible.
///
/// # Safety
///
/// The range must lie inside a live reservation and hold no live data.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let addr = ptr.cast::<libc::c_void>();
    if unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) } != 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Returns a whole reservation to the system.
///
/// # Safety
///
/// `ptr` and `len` must describe exactly one reservation returned by [`reserve`].
pub unsafe fn release(ptr: *mut u8, len: usize) -> io::Result<()> {
    if unsafe { libc::munmap(ptr.cast::<libc::c_void>(), len) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
