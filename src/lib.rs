//! vmarena - allocators on top of reserved virtual memory
//!
//! Reserve a large address range once and pay for physical pages only as
//! they get touched:
//! - [`Arena`]: linear bump allocator, optionally managed by an [`ArenaRegistry`]
//! - [`VirtualPool`] / [`Pool`]: fixed-size items recycled through a free list
//! - [`VirtualArray`]: flat array whose length drives committed pages
//!
//! None of the allocators lock internally. Each instance has one owner at a
//! time; share a registry across threads through [`SharedArenaRegistry`].

pub mod arena;
pub mod array;
pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod pool;

// Re-export commonly used items
pub use arena::{Arena, ArenaHandle, ArenaRegistry, SharedArenaRegistry};
pub use array::VirtualArray;
pub use config::{ArenaParams, RegistryConfig};
pub use error::{ErrorKind, Result, VmemError};
pub use platform::{MemoryUsage, OsMemory, PageInfo, Protection, VirtualMemory};
pub use pool::{Pool, VirtualPool};

/// Cache page size and allocation granularity for the process.
///
/// Optional: every allocator initializes the cache lazily. Calling it more
/// than once returns the cached values.
pub fn init() -> PageInfo {
    let info = platform::initialize();
    tracing::debug!(
        page_size = info.page_size,
        allocation_granularity = info.allocation_granularity,
        "virtual memory initialized"
    );
    info
}
