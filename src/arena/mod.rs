//! Linear arena over a single reserved address range
//!
//! Design: a byte cursor (`position`) walks forward through the range.
//! Pages are committed lazily, in whole pages, only when a push crosses the
//! committed boundary; popping never decommits. Trimming happens only
//! through [`Arena::clear`] and [`Arena::commit`].
//!
//! Arenas can be owned directly or managed through an [`ArenaRegistry`],
//! which hands out generation-checked handles.

mod registry;

#[cfg(test)]
mod tests;

pub use registry::{ArenaHandle, ArenaRegistry, SharedArenaRegistry};

use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::config::ArenaParams;
use crate::error::{Result, VmemError};
use crate::logging;
use crate::platform::{self, Protection, VirtualMemory};

pub struct Arena {
    vm: &'static dyn VirtualMemory,
    base: NonNull<u8>,
    position: usize,
    reserved_pages: usize,
    committed_pages: usize,
    page_size_shift: u8,
    alignment_shift: u8,
}

// An arena exclusively owns its reservation; moving it to another thread
// moves that ownership.
unsafe impl Send for Arena {}

impl Arena {
    /// Reserve and commit a standalone arena on the native backend.
    pub fn new(params: ArenaParams) -> Result<Self> {
        Self::with_backend(platform::os(), params)
    }

    pub fn with_backend(vm: &'static dyn VirtualMemory, params: ArenaParams) -> Result<Self> {
        params.validate()?;

        let page_size = (1usize << params.page_size_shift).max(vm.page_size());
        let page_size_shift = page_size.trailing_zeros() as u8;
        let reserved_bytes = platform::checked_align_forward(params.reserved_bytes, page_size)
            .ok_or(VmemError::InvalidSize { size: params.reserved_bytes })?;
        let commit_bytes = platform::checked_align_forward(params.commit_bytes, page_size)
            .ok_or(VmemError::InvalidSize { size: params.commit_bytes })?;

        let base = vm.reserve(reserved_bytes, Protection::NoAccess)?;
        if let Err(err) = unsafe { vm.commit(base, commit_bytes) } {
            // Give the address space back before reporting.
            unsafe {
                let _ = vm.release(base, reserved_bytes);
            }
            return Err(err);
        }

        Ok(Self {
            vm,
            base,
            position: 0,
            reserved_pages: reserved_bytes >> page_size_shift,
            committed_pages: commit_bytes >> page_size_shift,
            page_size_shift,
            alignment_shift: params.alignment_shift,
        })
    }

    /// Bump `size` bytes at the current position without alignment.
    pub fn push(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.push_at(self.position, size)
    }

    /// Bump `size` bytes after aligning the position to
    /// `max(alignment, self.alignment())`. Skipped bytes are not reused.
    pub fn push_aligned(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(VmemError::config(format!("alignment {} is not a power of two", alignment)));
        }
        let alignment = alignment.max(self.alignment());
        let addr = self.base.as_ptr() as usize;
        let aligned = addr
            .checked_add(self.position)
            .and_then(|cursor| platform::checked_align_forward(cursor, alignment))
            .map(|cursor| cursor - addr)
            .ok_or(VmemError::Grow { requested: usize::MAX, reserved: self.reserved_bytes() })?;
        self.push_at(aligned, size)
    }

    /// [`push`](Self::push) followed by zero-filling the block.
    pub fn push_zero(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.push(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// [`push_aligned`](Self::push_aligned) followed by zero-filling the block.
    pub fn push_zero_aligned(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let ptr = self.push_aligned(size, alignment)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    fn push_at(&mut self, start: usize, size: usize) -> Result<NonNull<u8>> {
        let reserved = self.reserved_bytes();
        if size == 0 {
            return Err(VmemError::Grow { requested: 0, reserved });
        }
        let end = start.checked_add(size).ok_or(VmemError::Grow { requested: usize::MAX, reserved })?;

        if end > self.committed_bytes() {
            let pages = self.pages_for(end).filter(|pages| *pages <= self.reserved_pages);
            let Some(pages) = pages else {
                return Err(VmemError::Grow { requested: end, reserved });
            };
            // The backend has logged the OS error; callers see a failed grow.
            if self.set_committed_pages(pages).is_err() {
                return Err(VmemError::Grow { requested: end, reserved });
            }
        }

        self.position = end;
        // SAFETY: start < end <= committed bytes.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Move the position back by `size` bytes, stopping at zero.
    #[inline]
    pub fn pop(&mut self, size: usize) {
        self.position -= size.min(self.position);
    }

    /// Move the position back to `position`; never moves it forward.
    #[inline]
    pub fn pop_to(&mut self, position: usize) {
        self.position = position.min(self.position);
    }

    /// Reset the position and trim committed memory down to
    /// `keep_committed_bytes`, rounded up to whole pages with at least one
    /// page kept.
    ///
    /// A failing decommit is logged and the pages stay accounted as
    /// committed; the position is reset either way.
    pub fn clear(&mut self, keep_committed_bytes: usize) {
        self.position = 0;

        let keep = self
            .pages_for(keep_committed_bytes)
            .unwrap_or(self.committed_pages)
            .max(1)
            .min(self.committed_pages);
        if keep < self.committed_pages {
            let committed = self.committed_bytes();
            let target = keep << self.page_size_shift;
            if let Err(cause) = self.set_committed_pages(keep) {
                logging::log_shrink_failure(&VmemError::Shrink { committed, target }, &cause);
            }
        }
    }

    /// Commit or decommit so exactly `committed_bytes` (rounded up to pages)
    /// are backed. Shrinking below the position pulls the position back.
    pub fn commit(&mut self, committed_bytes: usize) -> Result<()> {
        let reserved = self.reserved_bytes();
        let pages = self
            .pages_for(committed_bytes)
            .filter(|pages| *pages <= self.reserved_pages)
            .ok_or(VmemError::Grow { requested: committed_bytes, reserved })?;
        self.set_committed_pages(pages)?;
        self.position = self.position.min(self.committed_bytes());
        Ok(())
    }

    fn set_committed_pages(&mut self, pages: usize) -> Result<()> {
        unsafe {
            platform::partially_commit(
                self.vm,
                self.base,
                self.committed_bytes(),
                pages << self.page_size_shift,
            )?;
        }
        self.committed_pages = pages;
        Ok(())
    }

    fn pages_for(&self, bytes: usize) -> Option<usize> {
        Some(platform::checked_align_forward(bytes, self.page_size())? >> self.page_size_shift)
    }

    /// Decommit and release the whole range.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.release_region()
    }

    fn release_region(&self) -> Result<()> {
        // Release frees committed pages as well; a failed decommit is only logged.
        let _ = unsafe { self.vm.decommit(self.base, self.committed_bytes()) };
        unsafe { self.vm.release(self.base, self.reserved_bytes()) }
    }

    /// Base pointer valid, both capacities positive, position inside the
    /// committed range.
    pub fn is_valid(&self) -> bool {
        self.reserved_pages > 0 && self.committed_pages > 0 && self.position <= self.committed_bytes()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }

    #[inline]
    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_pages << self.page_size_shift
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed_pages << self.page_size_shift
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.page_size_shift
    }

    #[inline]
    pub fn page_size_shift(&self) -> u8 {
        self.page_size_shift
    }

    /// Minimum alignment of [`push_aligned`](Self::push_aligned).
    #[inline]
    pub fn alignment(&self) -> usize {
        1 << self.alignment_shift
    }

    #[inline]
    pub fn alignment_shift(&self) -> u8 {
        self.alignment_shift
    }

    /// Bytes that can still be pushed before hitting the reservation.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.reserved_bytes() - self.position
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let _ = self.release_region();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("position", &self.position)
            .field("committed_pages", &self.committed_pages)
            .field("reserved_pages", &self.reserved_pages)
            .field("page_size", &self.page_size())
            .finish()
    }
}
