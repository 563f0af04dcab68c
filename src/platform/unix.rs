//! mmap-based backend for unix targets

use std::io;
use std::ptr::{self, NonNull};

use super::{MemoryUsage, Protection};

fn prot_flags(protection: Protection) -> io::Result<libc::c_int> {
    Ok(match protection {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::Execute => libc::PROT_EXEC,
        Protection::ExecuteRead => libc::PROT_EXEC | libc::PROT_READ,
        Protection::ExecuteReadWrite => libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE,
        Protection::Invalid => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
    })
}

#[inline]
fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(super) fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

pub(super) fn query_allocation_granularity() -> usize {
    // mmap hands out page-granular ranges.
    query_page_size()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

pub(super) fn reserve(size: usize, protection: Protection) -> io::Result<NonNull<u8>> {
    let prot = prot_flags(protection)?;
    // SAFETY: anonymous mapping at a kernel-chosen address.
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, MAP_FLAGS, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

pub(super) unsafe fn release(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(libc::munmap(base.as_ptr().cast(), size))
}

pub(super) unsafe fn commit(base: NonNull<u8>, size: usize, protection: Protection) -> io::Result<()> {
    // Pages are backed on first touch; committing only opens up access.
    check(libc::mprotect(base.as_ptr().cast(), size, prot_flags(protection)?))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const DECOMMIT_ADVICE: libc::c_int = libc::MADV_DONTNEED;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const DECOMMIT_ADVICE: libc::c_int = libc::MADV_FREE;

pub(super) unsafe fn decommit(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(libc::madvise(base.as_ptr().cast(), size, DECOMMIT_ADVICE))?;
    check(libc::mprotect(base.as_ptr().cast(), size, libc::PROT_NONE))
}

pub(super) unsafe fn protect(base: NonNull<u8>, size: usize, protection: Protection) -> io::Result<()> {
    check(libc::mprotect(base.as_ptr().cast(), size, prot_flags(protection)?))
}

pub(super) unsafe fn lock(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(libc::mlock(base.as_ptr().cast_const().cast(), size))
}

pub(super) unsafe fn unlock(base: NonNull<u8>, size: usize) -> io::Result<()> {
    check(libc::munlock(base.as_ptr().cast_const().cast(), size))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(super) fn query_usage() -> MemoryUsage {
    // SAFETY: sysconf has no preconditions.
    let (pages, available, page) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_AVPHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    let to_bytes = |count: libc::c_long| {
        if count > 0 && page > 0 {
            (count as u64).saturating_mul(page as u64)
        } else {
            0
        }
    };
    MemoryUsage {
        total_physical_bytes: to_bytes(pages),
        available_physical_bytes: to_bytes(available),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(super) fn query_usage() -> MemoryUsage {
    // SAFETY: sysconf has no preconditions.
    let (pages, page) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    let total = if pages > 0 && page > 0 {
        (pages as u64).saturating_mul(page as u64)
    } else {
        0
    };
    MemoryUsage {
        total_physical_bytes: total,
        available_physical_bytes: 0,
    }
}
