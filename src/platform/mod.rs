//! Platform memory provider - OS virtual memory behind one interface
//!
//! Design: the allocators never call the OS directly. They talk to a
//! [`VirtualMemory`] implementation, which keeps the allocator logic free of
//! per-OS conditionals and lets tests swap in a fault-injecting backend.
//!
//! The build selects the native backend ([`OsMemory`]): `mmap`/`mprotect`
//! on unix, `VirtualAlloc`/`VirtualFree` on windows. Every call is a single
//! syscall; nothing is retried.

use core::fmt;
use core::ptr::NonNull;

use once_cell::sync::OnceCell;

use crate::error::{Result, VmemError};
use crate::logging;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as sys;

#[cfg(test)]
pub(crate) mod faulty;

/// Page protection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protection {
    /// Sentinel rejected by every operation.
    #[default]
    Invalid,
    NoAccess,
    Read,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    pub const ALL: [Protection; 6] = [
        Protection::NoAccess,
        Protection::Read,
        Protection::ReadWrite,
        Protection::Execute,
        Protection::ExecuteRead,
        Protection::ExecuteReadWrite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::NoAccess => "NoAccess",
            Self::Read => "Read",
            Self::ReadWrite => "ReadWrite",
            Self::Execute => "Execute",
            Self::ExecuteRead => "ExecuteRead",
            Self::ExecuteReadWrite => "ExecuteReadWrite",
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical memory status of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    pub total_physical_bytes: u64,
    pub available_physical_bytes: u64,
}

/// Page size and allocation granularity, queried once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_size: usize,
    pub allocation_granularity: usize,
}

/// Uniform capability over OS virtual memory.
///
/// # Safety
///
/// Implementors must return page-aligned ranges from `reserve`, and the
/// `unsafe` methods may only be called on ranges obtained from `reserve` of
/// the same implementation that have not been released yet. `base` and
/// `size` of commit/decommit/protect/lock/unlock must be page aligned.
pub unsafe trait VirtualMemory: Send + Sync {
    /// Reserve `size` bytes of address space with no physical backing.
    fn reserve(&self, size: usize, protection: Protection) -> Result<NonNull<u8>>;

    /// Return a reserved range to the OS. `size` must be the reserve size.
    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> Result<()>;

    /// Back pages with physical memory using the given protection.
    unsafe fn commit_protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()>;

    /// Back pages with physical memory, read-write.
    unsafe fn commit(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        self.commit_protect(base, size, Protection::ReadWrite)
    }

    /// Drop physical backing while keeping the range reserved.
    unsafe fn decommit(&self, base: NonNull<u8>, size: usize) -> Result<()>;

    /// Change protection of committed pages.
    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()>;

    /// Pin committed pages in physical memory.
    unsafe fn lock(&self, base: NonNull<u8>, size: usize) -> Result<()>;

    /// Undo [`VirtualMemory::lock`].
    unsafe fn unlock(&self, base: NonNull<u8>, size: usize) -> Result<()>;

    fn page_size(&self) -> usize;

    fn allocation_granularity(&self) -> usize;

    fn usage(&self) -> MemoryUsage;
}

// ============================================================================
// Page size cache
// ============================================================================

static PAGE_INFO: OnceCell<PageInfo> = OnceCell::new();

/// Query page size and allocation granularity from the OS and cache them.
///
/// Idempotent: the first call performs the query, later calls return the
/// cached values without touching the OS again.
pub fn initialize() -> PageInfo {
    *PAGE_INFO.get_or_init(|| PageInfo {
        page_size: sys::query_page_size(),
        allocation_granularity: sys::query_allocation_granularity(),
    })
}

/// Cached page size, or 0 if [`initialize`] has not run yet.
pub fn cached_page_size() -> usize {
    PAGE_INFO.get().map_or(0, |info| info.page_size)
}

/// Cached allocation granularity, or 0 if [`initialize`] has not run yet.
pub fn cached_allocation_granularity() -> usize {
    PAGE_INFO.get().map_or(0, |info| info.allocation_granularity)
}

/// Page size, initializing the cache on first use.
#[inline]
pub fn page_size() -> usize {
    initialize().page_size
}

/// Allocation granularity, initializing the cache on first use.
#[inline]
pub fn allocation_granularity() -> usize {
    initialize().allocation_granularity
}

/// Physical memory status straight from the OS.
pub fn query_usage() -> MemoryUsage {
    sys::query_usage()
}

// ============================================================================
// Alignment helpers
// ============================================================================

/// Round `value` up to a multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_forward(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment must be power of 2");
    (value.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_backward(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment must be power of 2");
    value & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & align.wrapping_sub(1) == 0
}

/// Checked variant of [`align_forward`] for sizes coming from callers.
#[inline]
pub(crate) fn checked_align_forward(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

// ============================================================================
// Native backend
// ============================================================================

/// Native OS backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsMemory;

static OS_MEMORY: OsMemory = OsMemory;

/// The native backend as a shareable trait object.
pub fn os() -> &'static dyn VirtualMemory {
    &OS_MEMORY
}

impl OsMemory {
    fn reserve_size(size: usize) -> Result<usize> {
        if size == 0 {
            return Err(VmemError::InvalidSize { size });
        }
        checked_align_forward(size, allocation_granularity()).ok_or(VmemError::InvalidSize { size })
    }
}

fn check_range(base: NonNull<u8>, size: usize) {
    debug_assert!(is_aligned(base.as_ptr() as usize, page_size()), "base must be page aligned");
    debug_assert!(is_aligned(size, page_size()), "size must be page aligned");
}

unsafe impl VirtualMemory for OsMemory {
    fn reserve(&self, size: usize, protection: Protection) -> Result<NonNull<u8>> {
        if !protection.is_valid() {
            return Err(VmemError::InvalidProtection);
        }
        let size = Self::reserve_size(size)?;
        match sys::reserve(size, protection) {
            Ok(base) => {
                logging::log_reserve(size, base.as_ptr());
                Ok(base)
            }
            Err(source) => {
                logging::log_os_failure("reserve", size, &source);
                Err(VmemError::ReserveFailed { size, source })
            }
        }
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        let size = Self::reserve_size(size)?;
        match sys::release(base, size) {
            Ok(()) => {
                logging::log_release(size, base.as_ptr());
                Ok(())
            }
            Err(source) => {
                logging::log_os_failure("release", size, &source);
                Err(VmemError::ReleaseFailed { size, source })
            }
        }
    }

    unsafe fn commit_protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()> {
        if !protection.is_valid() {
            return Err(VmemError::InvalidProtection);
        }
        if size == 0 {
            return Ok(());
        }
        check_range(base, size);
        match sys::commit(base, size, protection) {
            Ok(()) => {
                logging::log_commit(size, base.as_ptr());
                Ok(())
            }
            Err(source) => {
                logging::log_os_failure("commit", size, &source);
                Err(VmemError::CommitFailed { size, source })
            }
        }
    }

    unsafe fn decommit(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        check_range(base, size);
        match sys::decommit(base, size) {
            Ok(()) => {
                logging::log_decommit(size, base.as_ptr());
                Ok(())
            }
            Err(source) => {
                logging::log_os_failure("decommit", size, &source);
                Err(VmemError::DecommitFailed { size, source })
            }
        }
    }

    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()> {
        if !protection.is_valid() {
            return Err(VmemError::InvalidProtection);
        }
        if size == 0 {
            return Err(VmemError::InvalidSize { size });
        }
        check_range(base, size);
        sys::protect(base, size, protection).map_err(|source| {
            logging::log_os_failure("protect", size, &source);
            VmemError::ProtectFailed { size, source }
        })
    }

    unsafe fn lock(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        if size == 0 {
            return Err(VmemError::InvalidSize { size });
        }
        sys::lock(base, size).map_err(|source| {
            logging::log_os_failure("lock", size, &source);
            VmemError::LockFailed { size, source }
        })
    }

    unsafe fn unlock(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        if size == 0 {
            return Err(VmemError::InvalidSize { size });
        }
        sys::unlock(base, size).map_err(|source| {
            logging::log_os_failure("unlock", size, &source);
            VmemError::UnlockFailed { size, source }
        })
    }

    fn page_size(&self) -> usize {
        page_size()
    }

    fn allocation_granularity(&self) -> usize {
        allocation_granularity()
    }

    fn usage(&self) -> MemoryUsage {
        query_usage()
    }
}

/// Move the committed prefix of a reservation from `prev_committed` to
/// `committed` bytes, committing or decommitting only the difference.
///
/// # Safety
///
/// `base` must be a live reservation of `vm` and both sizes must be page
/// aligned and within that reservation.
pub unsafe fn partially_commit(
    vm: &dyn VirtualMemory,
    base: NonNull<u8>,
    prev_committed: usize,
    committed: usize,
) -> Result<()> {
    if committed > prev_committed {
        let start = NonNull::new_unchecked(base.as_ptr().add(prev_committed));
        vm.commit(start, committed - prev_committed)
    } else if committed < prev_committed {
        let start = NonNull::new_unchecked(base.as_ptr().add(committed));
        vm.decommit(start, prev_committed - committed)
    } else {
        Ok(())
    }
}
