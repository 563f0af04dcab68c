//! Error types shared by the platform layer and every allocator
//!
//! Errors are grouped by [`ErrorKind`]: configuration mistakes are caught
//! before the OS is touched, resource errors come straight from a failed
//! syscall, capacity errors mean the reservation ceiling was hit, and usage
//! errors flag caller-discipline violations that are cheap to detect.

use std::error::Error;
use std::fmt;
use std::io;

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, VmemError>;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid creation parameters, rejected before any OS call.
    Configuration,
    /// A reserve/commit/decommit/release/protect/lock/unlock syscall failed.
    Resource,
    /// The request does not fit in the reserved address range.
    Capacity,
    /// Caller-discipline violation (stale handle, released arena).
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Resource => "resource",
            Self::Capacity => "capacity",
            Self::Usage => "usage",
        };
        f.write_str(name)
    }
}

/// Errors produced by the virtual memory layer and the allocators on top of it.
#[derive(Debug)]
pub enum VmemError {
    /// Alignment shift outside `0..=16`.
    InvalidAlignmentShift { shift: u8 },
    /// Page-size shift outside `12..=20`.
    InvalidPageSizeShift { shift: u8 },
    /// `Protection::Invalid` (or an unmappable mode) was passed to the OS layer.
    InvalidProtection,
    /// A zero-sized or otherwise malformed size argument.
    InvalidSize { size: usize },
    /// Configuration could not be read or parsed.
    Config { message: String },

    ReserveFailed { size: usize, source: io::Error },
    ReleaseFailed { size: usize, source: io::Error },
    CommitFailed { size: usize, source: io::Error },
    DecommitFailed { size: usize, source: io::Error },
    ProtectFailed { size: usize, source: io::Error },
    LockFailed { size: usize, source: io::Error },
    UnlockFailed { size: usize, source: io::Error },

    /// Growing an arena or array would pass its reservation, or the request was empty.
    Grow { requested: usize, reserved: usize },
    /// Trimming committed pages failed; the memory stays committed.
    Shrink { committed: usize, target: usize },
    /// A pool has no free slot and cannot grow any further.
    PoolExhausted { capacity: usize },
    /// The arena registry has handed out all of its slots.
    RegistryFull { max_slots: usize },

    /// The handle refers to a released (or reused) registry slot.
    StaleHandle { index: u32, generation: u32 },
}

impl VmemError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAlignmentShift { .. }
            | Self::InvalidPageSizeShift { .. }
            | Self::InvalidProtection
            | Self::InvalidSize { .. }
            | Self::Config { .. } => ErrorKind::Configuration,

            Self::ReserveFailed { .. }
            | Self::ReleaseFailed { .. }
            | Self::CommitFailed { .. }
            | Self::DecommitFailed { .. }
            | Self::ProtectFailed { .. }
            | Self::LockFailed { .. }
            | Self::UnlockFailed { .. }
            | Self::Shrink { .. } => ErrorKind::Resource,

            Self::Grow { .. } | Self::PoolExhausted { .. } | Self::RegistryFull { .. } => {
                ErrorKind::Capacity
            }

            Self::StaleHandle { .. } => ErrorKind::Usage,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

impl fmt::Display for VmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAlignmentShift { shift } => {
                write!(f, "alignment shift {} is outside 0..=16", shift)
            }
            Self::InvalidPageSizeShift { shift } => {
                write!(f, "page size shift {} is outside 12..=20", shift)
            }
            Self::InvalidProtection => write!(f, "invalid protection mode"),
            Self::InvalidSize { size } => write!(f, "invalid size: {} bytes", size),
            Self::Config { message } => write!(f, "configuration error: {}", message),
            Self::ReserveFailed { size, source } => {
                write!(f, "failed to reserve {} bytes: {}", size, source)
            }
            Self::ReleaseFailed { size, source } => {
                write!(f, "failed to release {} bytes: {}", size, source)
            }
            Self::CommitFailed { size, source } => {
                write!(f, "failed to commit {} bytes: {}", size, source)
            }
            Self::DecommitFailed { size, source } => {
                write!(f, "failed to decommit {} bytes: {}", size, source)
            }
            Self::ProtectFailed { size, source } => {
                write!(f, "failed to change protection of {} bytes: {}", size, source)
            }
            Self::LockFailed { size, source } => {
                write!(f, "failed to lock {} bytes: {}", size, source)
            }
            Self::UnlockFailed { size, source } => {
                write!(f, "failed to unlock {} bytes: {}", size, source)
            }
            Self::Grow { requested, reserved } => {
                write!(f, "cannot grow to {} bytes, reservation is {} bytes", requested, reserved)
            }
            Self::Shrink { committed, target } => {
                write!(f, "failed to shrink committed memory from {} to {} bytes", committed, target)
            }
            Self::PoolExhausted { capacity } => {
                write!(f, "pool exhausted at {} items", capacity)
            }
            Self::RegistryFull { max_slots } => {
                write!(f, "arena registry is full ({} slots)", max_slots)
            }
            Self::StaleHandle { index, generation } => {
                write!(f, "stale arena handle: slot {} generation {}", index, generation)
            }
        }
    }
}

impl Error for VmemError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ReserveFailed { source, .. }
            | Self::ReleaseFailed { source, .. }
            | Self::CommitFailed { source, .. }
            | Self::DecommitFailed { source, .. }
            | Self::ProtectFailed { source, .. }
            | Self::LockFailed { source, .. }
            | Self::UnlockFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
