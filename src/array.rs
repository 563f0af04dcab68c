//! Resizable flat array over a fixed reservation
//!
//! Items are addressed purely by index. Changing the length commits or
//! decommits whole pages at the tail, so existing items never move.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::error::{Result, VmemError};
use crate::logging;
use crate::platform::{self, Protection, VirtualMemory};

pub struct VirtualArray {
    vm: &'static dyn VirtualMemory,
    base: NonNull<u8>,
    item_size: usize,
    len: usize,
    page_size: usize,
    reserved_pages: usize,
    committed_pages: usize,
}

// The array exclusively owns its reservation.
unsafe impl Send for VirtualArray {}

impl VirtualArray {
    /// Reserve `max_bytes` of address space and commit pages for `initial` items.
    pub fn new(item_size: usize, initial: usize, max_bytes: usize) -> Result<Self> {
        Self::with_backend(platform::os(), item_size, initial, max_bytes)
    }

    pub fn with_backend(
        vm: &'static dyn VirtualMemory,
        item_size: usize,
        initial: usize,
        max_bytes: usize,
    ) -> Result<Self> {
        if item_size == 0 {
            return Err(VmemError::InvalidSize { size: item_size });
        }
        if max_bytes == 0 {
            return Err(VmemError::InvalidSize { size: max_bytes });
        }

        let page_size = vm.page_size();
        let reserved_bytes =
            platform::checked_align_forward(max_bytes, page_size).ok_or(VmemError::InvalidSize { size: max_bytes })?;
        let commit_bytes = pages_for(initial, item_size, page_size)
            .map(|pages| pages * page_size)
            .filter(|bytes| *bytes <= reserved_bytes)
            .ok_or(VmemError::Grow {
                requested: initial.saturating_mul(item_size),
                reserved: reserved_bytes,
            })?;

        let base = vm.reserve(reserved_bytes, Protection::NoAccess)?;
        if let Err(err) = unsafe { vm.commit(base, commit_bytes) } {
            // Don't leak the reservation when the initial commit fails.
            unsafe {
                let _ = vm.release(base, reserved_bytes);
            }
            return Err(err);
        }

        Ok(Self {
            vm,
            base,
            item_size,
            len: initial,
            page_size,
            reserved_pages: reserved_bytes / page_size,
            committed_pages: commit_bytes / page_size,
        })
    }

    /// Set the logical length, committing or decommitting tail pages.
    pub fn set_len(&mut self, new_len: usize) -> Result<()> {
        let reserved = self.reserved_bytes();
        let pages = pages_for(new_len, self.item_size, self.page_size)
            .filter(|pages| *pages <= self.reserved_pages)
            .ok_or(VmemError::Grow {
                requested: new_len.saturating_mul(self.item_size),
                reserved,
            })?;

        if pages != self.committed_pages {
            unsafe {
                platform::partially_commit(
                    self.vm,
                    self.base,
                    self.committed_pages * self.page_size,
                    pages * self.page_size,
                )?;
            }
            self.committed_pages = pages;
        }

        logging::log_array_resize(self.len, new_len, self.committed_pages);
        self.len = new_len;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Items covered by committed pages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.committed_pages * self.page_size / self.item_size
    }

    /// Items the reservation can ever hold.
    #[inline]
    pub fn max_items(&self) -> usize {
        self.reserved_bytes() / self.item_size
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to item `index`, if it lies within the current length.
    pub fn get(&self, index: usize) -> Option<NonNull<u8>> {
        (index < self.len).then(|| self.ptr_at(index))
    }

    /// Pointer to item `index` without a length check.
    #[inline]
    pub(crate) fn ptr_at(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.max_items(), "index {} outside reservation", index);
        // SAFETY: the offset stays inside the reservation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.item_size)) }
    }

    #[inline]
    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    #[inline]
    pub fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    fn reserved_bytes(&self) -> usize {
        self.reserved_pages * self.page_size
    }

    /// Release the reservation, reporting failures.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { this.vm.release(this.base, this.reserved_bytes()) }
    }
}

impl Drop for VirtualArray {
    fn drop(&mut self) {
        // Release failures are already logged by the backend.
        let _ = unsafe { self.vm.release(self.base, self.reserved_bytes()) };
    }
}

impl std::fmt::Debug for VirtualArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualArray")
            .field("base", &self.base)
            .field("item_size", &self.item_size)
            .field("len", &self.len)
            .field("committed_pages", &self.committed_pages)
            .field("reserved_pages", &self.reserved_pages)
            .finish()
    }
}

/// Whole pages needed to hold `count` items, `None` on overflow.
fn pages_for(count: usize, item_size: usize, page_size: usize) -> Option<usize> {
    let bytes = count.checked_mul(item_size)?;
    Some(platform::checked_align_forward(bytes, page_size)? / page_size)
}
