//! VirtualAlloc-based backend for windows targets

use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use winapi::shared::minwindef::DWORD;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualLock, VirtualProtect, VirtualUnlock};
use winapi::um::sysinfoapi::{GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

use super::{MemoryUsage, Protection};

fn page_flags(protection: Protection) -> io::Result<DWORD> {
    Ok(match protection {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::Execute => PAGE_EXECUTE,
        Protection::ExecuteRead => PAGE_EXECUTE_READ,
        Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        Protection::Invalid => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
    })
}

#[inline]
fn check(ok: i32) -> io::Result<()> {
    if ok != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills the whole struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

pub(super) fn query_page_size() -> usize {
    system_info().dwPageSize as usize
}

pub(super) fn query_allocation_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}

pub(super) fn reserve(size: usize, protection: Protection) -> io::Result<NonNull<u8>> {
    let flags = page_flags(protection)?;
    // SAFETY: null base lets the OS choose the address.
    let ptr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, flags) };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
}

pub(super) unsafe fn release(base: NonNull<u8>, _size: usize) -> io::Result<()> {
    // MEM_RELEASE requires a zero size and frees the whole reservation.
    check(VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE))
}

pub(super) unsafe fn commit(base: NonNull<u8>, size: usize, protection: Protection) -> io::Result<()> {
    let ptr = VirtualAlloc(base.as_ptr().cast(), size, MEM_COMMIT, page_flags(protection)?);
    if ptr.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(super) unsafe fn decommit(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(VirtualFree(base.as_ptr().cast(), size, MEM_DECOMMIT))
}

pub(super) unsafe fn protect(base: NonNull<u8>, size: usize, protection: Protection) -> io::Result<()> {
    let mut old: DWORD = 0;
    check(VirtualProtect(base.as_ptr().cast(), size, page_flags(protection)?, &mut old))
}

pub(super) unsafe fn lock(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(VirtualLock(base.as_ptr().cast(), size))
}

pub(super) unsafe fn unlock(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(VirtualUnlock(base.as_ptr().cast(), size))
}

pub(super) fn query_usage() -> MemoryUsage {
    // SAFETY: dwLength is set before the call as the API requires.
    unsafe {
        let mut status: MEMORYSTATUSEX = mem::zeroed();
        status.dwLength = mem::size_of::<MEMORYSTATUSEX>() as DWORD;
        if GlobalMemoryStatusEx(&mut status) == 0 {
            return MemoryUsage::default();
        }
        MemoryUsage {
            total_physical_bytes: status.ullTotalPhys,
            available_physical_bytes: status.ullAvailPhys,
        }
    }
}
