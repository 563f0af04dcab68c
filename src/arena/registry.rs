//! Arena registry - slot table of live arenas with reusable slots
//!
//! The slot table lives in its own [`VirtualArray`], so it grows the same
//! way the allocators do: by committing more pages of an up-front
//! reservation. Released slots are threaded onto a free list and reused
//! first. Every slot carries a generation that is bumped on release, which
//! turns use of a released (or reused) slot into a `StaleHandle` error.

use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use super::Arena;
use crate::array::VirtualArray;
use crate::config::{ArenaParams, RegistryConfig};
use crate::error::{Result, VmemError};
use crate::logging;
use crate::platform::{self, VirtualMemory};

/// Registry behind a lock, for embedders that touch it from several threads.
pub type SharedArenaRegistry = Mutex<ArenaRegistry>;

/// Generation-checked reference to an arena in an [`ArenaRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle {
    index: u32,
    generation: u32,
}

impl ArenaHandle {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

enum SlotState {
    Vacant { next_free: Option<u32> },
    Occupied { arena: Arena, name: Option<&'static str> },
}

struct Slot {
    generation: u32,
    state: SlotState,
}

pub struct ArenaRegistry {
    slots: VirtualArray,
    /// Slots below this index hold an initialized `Slot`.
    high_water: usize,
    free_head: Option<u32>,
    live: usize,
    config: RegistryConfig,
    vm: &'static dyn VirtualMemory,
}

impl ArenaRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_backend(platform::os(), config)
    }

    pub fn with_backend(vm: &'static dyn VirtualMemory, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let slot_size = mem::size_of::<Slot>();
        let max_bytes = config
            .max_slots
            .checked_mul(slot_size)
            .ok_or(VmemError::InvalidSize { size: config.max_slots })?;
        let slots = VirtualArray::with_backend(vm, slot_size, config.initial_slots, max_bytes)?;

        Ok(Self {
            slots,
            high_water: 0,
            free_head: None,
            live: 0,
            config,
            vm,
        })
    }

    /// Registry wrapped in a [`SharedArenaRegistry`].
    pub fn shared(config: RegistryConfig) -> Result<SharedArenaRegistry> {
        Ok(Mutex::new(Self::new(config)?))
    }

    /// Create an arena using the registry's default alignment and page size.
    pub fn alloc(&mut self, reserved_bytes: usize, commit_bytes: usize) -> Result<ArenaHandle> {
        let params = ArenaParams::new(reserved_bytes, commit_bytes)
            .with_alignment_shift(self.config.default_alignment_shift)
            .with_page_size_shift(self.config.default_page_size_shift);
        self.alloc_with(params)
    }

    pub fn alloc_with(&mut self, params: ArenaParams) -> Result<ArenaHandle> {
        let arena = Arena::with_backend(self.vm, params)?;
        // On failure the arena is dropped here, returning its range.
        let index = self.acquire_slot()?;
        let (reserved, committed) = (arena.reserved_bytes(), arena.committed_bytes());
        let state = SlotState::Occupied { arena, name: None };

        let generation = if index as usize == self.high_water {
            // SAFETY: the slot is committed and has never been initialized.
            unsafe { self.slot_ptr(index).as_ptr().write(Slot { generation: 0, state }) };
            self.high_water += 1;
            0
        } else {
            let slot = self.slot_mut_unchecked(index);
            slot.state = state;
            slot.generation
        };

        self.live += 1;
        logging::log_arena_alloc(index, reserved, committed);
        Ok(ArenaHandle { index, generation })
    }

    fn acquire_slot(&mut self) -> Result<u32> {
        if let Some(index) = self.free_head {
            self.free_head = match self.slot_unchecked(index).state {
                SlotState::Vacant { next_free } => next_free,
                // Only vacant slots are ever linked.
                SlotState::Occupied { .. } => None,
            };
            return Ok(index);
        }

        if self.high_water >= self.slots.len() {
            self.grow()?;
        }
        Ok(self.high_water as u32)
    }

    /// Commit more slots: an eighth of the current count, at least one
    /// page worth, never past `max_slots`.
    fn grow(&mut self) -> Result<()> {
        let old = self.slots.len();
        if old >= self.config.max_slots {
            return Err(VmemError::RegistryFull { max_slots: self.config.max_slots });
        }
        let per_page = (self.slots.page_size() / self.slots.item_size()).max(1);
        let new = (old + (old / 8).max(per_page)).min(self.config.max_slots);
        self.slots.set_len(new)?;
        logging::log_registry_grow(old, new);
        Ok(())
    }

    /// Release the arena behind `handle` and recycle its slot.
    ///
    /// The slot is recycled even if the OS refuses to release the range; the
    /// error is still reported.
    pub fn release(&mut self, handle: ArenaHandle) -> Result<()> {
        self.check(handle)?;
        let next_free = self.free_head;
        let slot = self.slot_mut_unchecked(handle.index);
        let state = mem::replace(&mut slot.state, SlotState::Vacant { next_free });
        slot.generation = slot.generation.wrapping_add(1);
        self.free_head = Some(handle.index);
        self.live -= 1;

        match state {
            SlotState::Occupied { arena, name } => {
                logging::log_arena_release(handle.index, name);
                arena.release()
            }
            SlotState::Vacant { .. } => Ok(()),
        }
    }

    pub fn get(&self, handle: ArenaHandle) -> Result<&Arena> {
        self.check(handle)?;
        match &self.slot_unchecked(handle.index).state {
            SlotState::Occupied { arena, .. } => Ok(arena),
            SlotState::Vacant { .. } => Err(stale(handle)),
        }
    }

    pub fn get_mut(&mut self, handle: ArenaHandle) -> Result<&mut Arena> {
        self.check(handle)?;
        match &mut self.slot_mut_unchecked(handle.index).state {
            SlotState::Occupied { arena, .. } => Ok(arena),
            SlotState::Vacant { .. } => Err(stale(handle)),
        }
    }

    /// Attach a diagnostic label to an arena.
    pub fn set_name(&mut self, handle: ArenaHandle, label: &'static str) -> Result<()> {
        self.check(handle)?;
        if let SlotState::Occupied { name, .. } = &mut self.slot_mut_unchecked(handle.index).state {
            *name = Some(label);
        }
        Ok(())
    }

    pub fn name(&self, handle: ArenaHandle) -> Result<Option<&'static str>> {
        self.check(handle)?;
        match self.slot_unchecked(handle.index).state {
            SlotState::Occupied { name, .. } => Ok(name),
            SlotState::Vacant { .. } => Err(stale(handle)),
        }
    }

    /// Live handle pointing at a valid arena.
    pub fn is_valid(&self, handle: ArenaHandle) -> bool {
        self.get(handle).map_or(false, Arena::is_valid)
    }

    /// Arenas currently allocated.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Slots backed by committed pages.
    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots ever handed out.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    #[inline]
    pub fn max_slots(&self) -> usize {
        self.config.max_slots
    }

    #[inline]
    pub fn default_alignment_shift(&self) -> u8 {
        self.config.default_alignment_shift
    }

    #[inline]
    pub fn default_page_size_shift(&self) -> u8 {
        self.config.default_page_size_shift
    }

    /// Release every live arena and then the slot table, reporting the
    /// first failure.
    pub fn teardown(mut self) -> Result<()> {
        let arenas = self.release_all();
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the slot table is moved out
        // exactly once; the remaining fields own no resources.
        let slots = unsafe { ptr::read(&this.slots) };
        arenas.and(slots.release())
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for index in 0..self.high_water as u32 {
            let slot = self.slot_mut_unchecked(index);
            if let SlotState::Occupied { .. } = slot.state {
                let state = mem::replace(&mut slot.state, SlotState::Vacant { next_free: None });
                if let SlotState::Occupied { arena, name } = state {
                    logging::log_arena_release(index, name);
                    if let Err(err) = arena.release() {
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        self.high_water = 0;
        self.free_head = None;
        self.live = 0;
        first_error.map_or(Ok(()), Err)
    }

    fn check(&self, handle: ArenaHandle) -> Result<()> {
        if (handle.index as usize) < self.high_water {
            let slot = self.slot_unchecked(handle.index);
            if slot.generation == handle.generation && matches!(slot.state, SlotState::Occupied { .. }) {
                return Ok(());
            }
        }
        Err(stale(handle))
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> NonNull<Slot> {
        self.slots.ptr_at(index as usize).cast()
    }

    fn slot_unchecked(&self, index: u32) -> &Slot {
        debug_assert!((index as usize) < self.high_water);
        // SAFETY: slots below the high-water mark are initialized.
        unsafe { self.slot_ptr(index).as_ref() }
    }

    fn slot_mut_unchecked(&mut self, index: u32) -> &mut Slot {
        debug_assert!((index as usize) < self.high_water);
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { self.slot_ptr(index).as_mut() }
    }
}

fn stale(handle: ArenaHandle) -> VmemError {
    VmemError::StaleHandle { index: handle.index, generation: handle.generation }
}

impl Drop for ArenaRegistry {
    fn drop(&mut self) {
        // Vacant slots own nothing; occupied ones release their arena.
        let _ = self.release_all();
    }
}

impl std::fmt::Debug for ArenaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaRegistry")
            .field("live", &self.live)
            .field("high_water", &self.high_water)
            .field("slot_capacity", &self.slots.len())
            .field("max_slots", &self.config.max_slots)
            .finish()
    }
}
