//! Registry and arena configuration
//!
//! Registry settings can come from a TOML file, a TOML string, or
//! `VMARENA_*` environment variables; anything left out falls back to the
//! defaults. Arena parameters are validated before any OS call is made.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, VmemError};
use crate::platform;

pub const MIN_ALIGNMENT_SHIFT: u8 = 0;
pub const MAX_ALIGNMENT_SHIFT: u8 = 16;
pub const MIN_PAGE_SIZE_SHIFT: u8 = 12;
pub const MAX_PAGE_SIZE_SHIFT: u8 = 20;

/// Settings for an [`ArenaRegistry`](crate::ArenaRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Slots committed up front
    #[serde(default = "default_initial_slots")]
    pub initial_slots: usize,

    /// Hard ceiling on live arenas
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    /// Minimum push alignment for arenas created with defaults, as log2
    #[serde(default = "default_alignment_shift")]
    pub default_alignment_shift: u8,

    /// Arena page size for arenas created with defaults, as log2
    #[serde(default = "default_page_size_shift")]
    pub default_page_size_shift: u8,
}

fn default_initial_slots() -> usize { 32 }
fn default_max_slots() -> usize { 1024 }
fn default_alignment_shift() -> u8 { 3 }
fn default_page_size_shift() -> u8 { 12 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            initial_slots: default_initial_slots(),
            max_slots: default_max_slots(),
            default_alignment_shift: default_alignment_shift(),
            default_page_size_shift: default_page_size_shift(),
        }
    }
}

impl RegistryConfig {
    pub fn new(initial_slots: usize, max_slots: usize) -> Self {
        Self {
            initial_slots,
            max_slots,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| VmemError::config(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VmemError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VMARENA_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_number("VMARENA_INITIAL_SLOTS")? {
            config.initial_slots = value;
        }
        if let Some(value) = env_number("VMARENA_MAX_SLOTS")? {
            config.max_slots = value;
        }
        if let Some(value) = env_number("VMARENA_ALIGNMENT_SHIFT")? {
            config.default_alignment_shift = value;
        }
        if let Some(value) = env_number("VMARENA_PAGE_SIZE_SHIFT")? {
            config.default_page_size_shift = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_alignment_shift(self.default_alignment_shift)?;
        check_page_size_shift(self.default_page_size_shift)?;

        if self.max_slots == 0 || self.max_slots > u32::MAX as usize {
            return Err(VmemError::config(format!("max_slots {} is out of range", self.max_slots)));
        }
        if self.initial_slots == 0 || self.initial_slots > self.max_slots {
            return Err(VmemError::config(format!(
                "initial_slots {} must be in 1..={}",
                self.initial_slots, self.max_slots
            )));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VmemError::config(format!("failed to serialize config: {}", e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path, content)
            .map_err(|e| VmemError::config(format!("failed to write {}: {}", path.display(), e)))
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| VmemError::config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

pub(crate) fn check_alignment_shift(shift: u8) -> Result<()> {
    if (MIN_ALIGNMENT_SHIFT..=MAX_ALIGNMENT_SHIFT).contains(&shift) {
        Ok(())
    } else {
        Err(VmemError::InvalidAlignmentShift { shift })
    }
}

pub(crate) fn check_page_size_shift(shift: u8) -> Result<()> {
    if (MIN_PAGE_SIZE_SHIFT..=MAX_PAGE_SIZE_SHIFT).contains(&shift) {
        Ok(())
    } else {
        Err(VmemError::InvalidPageSizeShift { shift })
    }
}

/// Creation parameters of a single arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaParams {
    pub reserved_bytes: usize,
    pub commit_bytes: usize,
    pub alignment_shift: u8,
    pub page_size_shift: u8,
}

impl ArenaParams {
    pub fn new(reserved_bytes: usize, commit_bytes: usize) -> Self {
        Self {
            reserved_bytes,
            commit_bytes,
            alignment_shift: default_alignment_shift(),
            page_size_shift: default_page_size_shift(),
        }
    }

    pub fn with_alignment_shift(mut self, shift: u8) -> Self {
        self.alignment_shift = shift;
        self
    }

    pub fn with_page_size_shift(mut self, shift: u8) -> Self {
        self.page_size_shift = shift;
        self
    }

    /// Page size the arena will actually use: the requested page size, but
    /// never smaller than the OS page.
    pub fn effective_page_size(&self) -> usize {
        let requested = 1usize << self.page_size_shift;
        requested.max(platform::page_size())
    }

    pub fn validate(&self) -> Result<()> {
        check_alignment_shift(self.alignment_shift)?;
        check_page_size_shift(self.page_size_shift)?;

        if self.reserved_bytes == 0 {
            return Err(VmemError::InvalidSize { size: 0 });
        }
        let page = self.effective_page_size();
        let reserved = platform::checked_align_forward(self.reserved_bytes, page)
            .ok_or(VmemError::InvalidSize { size: self.reserved_bytes })?;
        let commit = platform::checked_align_forward(self.commit_bytes, page)
            .ok_or(VmemError::InvalidSize { size: self.commit_bytes })?;
        if commit > reserved {
            return Err(VmemError::Grow { requested: commit, reserved });
        }
        Ok(())
    }
}
