//! Fixed-size item pool over a reserved address range
//!
//! Slots are handed out from two sources: a free list of recycled slots and
//! a cursor over slots that were never used. A vacant slot stores the index
//! of the next vacant slot in its first four bytes ([`FreeLink`]), so the
//! free list costs no memory beyond the slots themselves.
//!
//! Committed pages grow on demand and never past the reservation chosen at
//! creation time.

use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

use crate::error::{Result, VmemError};
use crate::logging;
use crate::platform::{self, Protection, VirtualMemory};

/// Link stored in the first bytes of a vacant slot.
///
/// Occupied slots hold caller data; vacant ones hold only this link. Both
/// views share the same storage, which is why every item is at least
/// `size_of::<FreeLink>()` bytes.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeLink(u32);

impl FreeLink {
    /// Terminates the free list.
    const EMPTY: FreeLink = FreeLink(u32::MAX);

    #[inline]
    fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// # Safety
    /// `slot` must point at a committed, vacant slot.
    #[inline]
    unsafe fn read(slot: NonNull<u8>) -> FreeLink {
        slot.as_ptr().cast::<FreeLink>().read_unaligned()
    }

    /// # Safety
    /// `slot` must point at a committed slot the caller no longer uses.
    #[inline]
    unsafe fn write(slot: NonNull<u8>, link: FreeLink) {
        slot.as_ptr().cast::<FreeLink>().write_unaligned(link)
    }
}

const MIN_ITEM_SIZE: usize = mem::size_of::<FreeLink>();

/// How a pool reacts when every committed slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    /// Commit just enough pages for the next item.
    Paged,
    /// Grow capacity to 1.5x the live item count.
    Proportional,
}

pub struct VirtualPool {
    vm: &'static dyn VirtualMemory,
    base: NonNull<u8>,
    item_size: usize,
    capacity: usize,
    max_items: usize,
    len: usize,
    free_head: FreeLink,
    next_unused: usize,
    page_size: usize,
    committed_pages: usize,
    reserved_pages: usize,
    growth: Growth,
}

// The pool exclusively owns its reservation.
unsafe impl Send for VirtualPool {}

impl VirtualPool {
    /// Pool with a fixed ceiling of `maximum` items; committed pages grow
    /// one page at a time as slots run out.
    pub fn new(item_size: usize, item_align: usize, initial: usize, maximum: usize) -> Result<Self> {
        Self::create(platform::os(), item_size, item_align, initial, maximum, Growth::Paged)
    }

    /// Self-growing pool: on exhaustion capacity grows to 1.5x the live count.
    pub fn growable(item_size: usize, item_align: usize, initial: usize, maximum: usize) -> Result<Self> {
        Self::create(platform::os(), item_size, item_align, initial, maximum, Growth::Proportional)
    }

    /// [`new`](Self::new) on an explicit backend.
    pub fn with_backend(
        vm: &'static dyn VirtualMemory,
        item_size: usize,
        item_align: usize,
        initial: usize,
        maximum: usize,
    ) -> Result<Self> {
        Self::create(vm, item_size, item_align, initial, maximum, Growth::Paged)
    }

    /// [`growable`](Self::growable) on an explicit backend.
    pub fn growable_with_backend(
        vm: &'static dyn VirtualMemory,
        item_size: usize,
        item_align: usize,
        initial: usize,
        maximum: usize,
    ) -> Result<Self> {
        Self::create(vm, item_size, item_align, initial, maximum, Growth::Proportional)
    }

    fn create(
        vm: &'static dyn VirtualMemory,
        item_size: usize,
        item_align: usize,
        initial: usize,
        maximum: usize,
        growth: Growth,
    ) -> Result<Self> {
        let page_size = vm.page_size();
        if !item_align.is_power_of_two() || item_align > page_size {
            return Err(VmemError::config(format!("item alignment {} is not supported", item_align)));
        }
        if maximum == 0 || maximum >= u32::MAX as usize {
            return Err(VmemError::config(format!("maximum item count {} is out of range", maximum)));
        }

        let align = item_align.max(MIN_ITEM_SIZE);
        let item_size = platform::checked_align_forward(item_size.max(MIN_ITEM_SIZE), align)
            .ok_or(VmemError::InvalidSize { size: item_size })?;

        let reserved_pages = pages_for(maximum, item_size, page_size).ok_or(VmemError::InvalidSize {
            size: maximum.saturating_mul(item_size),
        })?;
        let committed_pages = pages_for(initial.min(maximum), item_size, page_size)
            .unwrap_or(reserved_pages)
            .min(reserved_pages);

        let reserved_bytes = reserved_pages * page_size;
        let base = vm.reserve(reserved_bytes, Protection::NoAccess)?;
        if let Err(err) = unsafe { vm.commit(base, committed_pages * page_size) } {
            unsafe {
                let _ = vm.release(base, reserved_bytes);
            }
            return Err(err);
        }

        let mut pool = Self {
            vm,
            base,
            item_size,
            capacity: 0,
            max_items: maximum,
            len: 0,
            free_head: FreeLink::EMPTY,
            next_unused: 0,
            page_size,
            committed_pages,
            reserved_pages,
            growth,
        };
        pool.capacity = pool.items_in(committed_pages);
        Ok(pool)
    }

    /// Hand out a slot: recycled first, then never-used, then after growing.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        if !self.free_head.is_empty() {
            let slot = self.ptr_at(self.free_head.0);
            // SAFETY: slots on the free list are committed and vacant.
            self.free_head = unsafe { FreeLink::read(slot) };
            self.len += 1;
            return Ok(slot);
        }

        if self.next_unused >= self.capacity {
            self.grow()?;
        }

        let index = self.next_unused as u32;
        self.next_unused += 1;
        self.len += 1;
        Ok(self.ptr_at(index))
    }

    fn grow(&mut self) -> Result<()> {
        if self.capacity >= self.max_items {
            return Err(VmemError::PoolExhausted { capacity: self.capacity });
        }
        let target = match self.growth {
            Growth::Paged => self.capacity + 1,
            Growth::Proportional => (self.len * 3 / 2).max(self.len + 1),
        };
        self.set_capacity(target.min(self.max_items))
    }

    /// Return a slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this pool and
    /// must not have been deallocated since. The slot's first bytes are
    /// overwritten.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.len > 0, "deallocate on an empty pool");
        let index = self.index_of(ptr);
        FreeLink::write(ptr, self.free_head);
        self.free_head = FreeLink(index);
        self.len -= 1;
    }

    /// Slot index of a pointer handed out by this pool.
    #[inline]
    pub fn index_of(&self, ptr: NonNull<u8>) -> u32 {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        debug_assert!(offset < self.next_unused * self.item_size, "pointer outside pool");
        debug_assert!(offset % self.item_size == 0, "pointer not at a slot boundary");
        (offset / self.item_size) as u32
    }

    /// Pointer to slot `index`.
    #[inline]
    pub fn ptr_at(&self, index: u32) -> NonNull<u8> {
        debug_assert!((index as usize) < self.capacity, "index {} past capacity", index);
        // SAFETY: the offset stays inside the reservation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.item_size)) }
    }

    /// Commit or decommit pages so exactly `items` slots are backed.
    ///
    /// Slots that were ever handed out are never decommitted, so a shrink
    /// stops at the high-water mark of used slots.
    pub fn set_capacity(&mut self, items: usize) -> Result<()> {
        if items > self.max_items {
            return Err(VmemError::Grow {
                requested: items.saturating_mul(self.item_size),
                reserved: self.reserved_pages * self.page_size,
            });
        }
        let items = items.max(self.next_unused);
        let pages = pages_for(items, self.item_size, self.page_size)
            .unwrap_or(self.reserved_pages)
            .min(self.reserved_pages);

        if pages != self.committed_pages {
            unsafe {
                platform::partially_commit(
                    self.vm,
                    self.base,
                    self.committed_pages * self.page_size,
                    pages * self.page_size,
                )?;
            }
            let old = self.capacity;
            self.committed_pages = pages;
            self.capacity = self.items_in(pages);
            logging::log_pool_resize(old, self.capacity);
        }
        Ok(())
    }

    fn items_in(&self, pages: usize) -> usize {
        (pages * self.page_size / self.item_size).min(self.max_items)
    }

    /// Slots backed by committed pages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently handed out.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot size after rounding for alignment and the free-list link.
    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    #[inline]
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    #[inline]
    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    /// Release the reservation, reporting failures.
    pub fn teardown(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { this.vm.release(this.base, this.reserved_pages * this.page_size) }
    }
}

impl Drop for VirtualPool {
    fn drop(&mut self) {
        let _ = unsafe { self.vm.release(self.base, self.reserved_pages * self.page_size) };
    }
}

impl std::fmt::Debug for VirtualPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPool")
            .field("base", &self.base)
            .field("item_size", &self.item_size)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("max_items", &self.max_items)
            .finish()
    }
}

fn pages_for(count: usize, item_size: usize, page_size: usize) -> Option<usize> {
    let bytes = count.checked_mul(item_size)?;
    Some(platform::checked_align_forward(bytes, page_size)? / page_size)
}

/// Typed pool of `T` values.
///
/// Live values are not dropped when the pool goes away; call
/// [`free`](Pool::free) for values that need their destructor run.
pub struct Pool<T> {
    inner: VirtualPool,
    _marker: PhantomData<T>,
}

impl<T> Pool<T> {
    /// e.g. `Pool::<Entity>::setup(32768, 16_777_216)`
    pub fn setup(initial: usize, maximum: usize) -> Result<Self> {
        let inner = VirtualPool::growable(mem::size_of::<T>(), mem::align_of::<T>(), initial, maximum)?;
        Ok(Self { inner, _marker: PhantomData })
    }

    /// Move `value` into a fresh slot.
    pub fn alloc(&mut self, value: T) -> Result<NonNull<T>> {
        let slot = self.inner.allocate()?.cast::<T>();
        // SAFETY: the slot is committed, sized and aligned for T.
        unsafe { slot.as_ptr().write(value) };
        Ok(slot)
    }

    /// Drop the value and recycle its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) on this pool and must not
    /// have been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        std::ptr::drop_in_place(ptr.as_ptr());
        self.inner.deallocate(ptr.cast());
    }

    #[inline]
    pub fn ptr_at(&self, index: u32) -> NonNull<T> {
        self.inner.ptr_at(index).cast()
    }

    #[inline]
    pub fn index_of(&self, ptr: NonNull<T>) -> u32 {
        self.inner.index_of(ptr.cast())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn teardown(self) -> Result<()> {
        self.inner.teardown()
    }
}
