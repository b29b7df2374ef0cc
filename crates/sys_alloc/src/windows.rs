use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

/// Reserves `len` bytes of inaccessible address space, preferably at `hint_addr`.
pub unsafe fn reserve(hint_addr: usize, len: usize) -> io::Result<*mut u8> {
    let addr = if hint_addr == 0 {
        ptr::null()
    } else {
        hint_addr as *const std::ffi::c_void
    };

    let mut ptr = unsafe { VirtualAlloc(addr, len, MEM_RESERVE, PAGE_NOACCESS) };

    // A taken hint is not an error: let the OS pick.
    if ptr.is_null() && !addr.is_null() {
        ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
    }

    if ptr.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(ptr.cast::<u8>())
}

/// Makes `[ptr, ptr + len)` readable and writable.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let got = unsafe { VirtualAlloc(ptr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
    if got.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Drops the physical backing of `[ptr, ptr + len)`.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    if unsafe { VirtualFree(ptr.cast(), len, MEM_DECOMMIT) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Returns a whole reservation to the system.
pub unsafe fn release(ptr: *mut u8, _len: usize) -> io::Result<()> {
    // MEM_RELEASE requires dwSize to be 0
    if unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
