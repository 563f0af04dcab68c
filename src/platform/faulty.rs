//! Fault-injecting backend for unit tests

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{MemoryUsage, OsMemory, Protection, VirtualMemory};
use crate::error::{Result, VmemError};

/// Delegates to [`OsMemory`] and fails selected operations on demand.
#[derive(Debug, Default)]
pub(crate) struct FaultyMemory {
    pub fail_reserve: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_decommit: AtomicBool,
    pub fail_release: AtomicBool,
    pub commits: AtomicUsize,
    pub decommits: AtomicUsize,
    pub releases: AtomicUsize,
}

impl FaultyMemory {
    /// A fresh backend that lives for the rest of the test binary.
    pub fn leaked() -> &'static FaultyMemory {
        Box::leak(Box::default())
    }

    pub fn set_fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_decommit(&self, fail: bool) {
        self.fail_decommit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn commit_calls(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn decommit_calls(&self) -> usize {
        self.decommits.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

fn injected() -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, "injected failure")
}

unsafe impl VirtualMemory for FaultyMemory {
    fn reserve(&self, size: usize, protection: Protection) -> Result<NonNull<u8>> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(VmemError::ReserveFailed { size, source: injected() });
        }
        OsMemory.reserve(size, protection)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        OsMemory.release(base, size)?;
        // The range is unmapped either way so failing tests don't leak it.
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(VmemError::ReleaseFailed { size, source: injected() });
        }
        Ok(())
    }

    unsafe fn commit_protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(VmemError::CommitFailed { size, source: injected() });
        }
        OsMemory.commit_protect(base, size, protection)
    }

    unsafe fn decommit(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        self.decommits.fetch_add(1, Ordering::SeqCst);
        if self.fail_decommit.load(Ordering::SeqCst) {
            return Err(VmemError::DecommitFailed { size, source: injected() });
        }
        OsMemory.decommit(base, size)
    }

    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> Result<()> {
        OsMemory.protect(base, size, protection)
    }

    unsafe fn lock(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        OsMemory.lock(base, size)
    }

    unsafe fn unlock(&self, base: NonNull<u8>, size: usize) -> Result<()> {
        OsMemory.unlock(base, size)
    }

    fn page_size(&self) -> usize {
        OsMemory.page_size()
    }

    fn allocation_granularity(&self) -> usize {
        OsMemory.allocation_granularity()
    }

    fn usage(&self) -> MemoryUsage {
        OsMemory.usage()
    }
}
