//! Logging infrastructure - structured tracing for the allocators
//!
//! Design: the library only emits `tracing` events. Embedding code decides
//! whether a subscriber is installed, either its own or the one built by
//! [`init`] / [`init_with_config`]:
//! - Per-module filtering through `EnvFilter`
//! - Zero-cost when no subscriber is installed
//! - Optional file output through `tracing-appender`

use std::io;
use std::path::Path;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the non-blocking file writer alive until [`shutdown`].
static FILE_GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console output when `None`
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // VMARENA_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("VMARENA_LOG_LEVEL") {
            config.level = parse_level(&level_str).unwrap_or(Level::INFO);
        }

        // VMARENA_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("VMARENA_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("VMARENA_LOG_JSON").is_ok();
        config.show_spans = std::env::var("VMARENA_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging allocator behaviour
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

fn parse_level(value: &str) -> Option<Level> {
    match value.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration taken from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber; later calls are no-ops. If the
/// process already has a global subscriber the call leaves it in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("vmarena={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().map(Path::new) {
            Some(path) => {
                let directory = path.parent().unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "vmarena.log".to_string());
                let appender = tracing_appender::rolling::never(directory, file_name);
                tracing_appender::non_blocking(appender)
            }
            None => tracing_appender::non_blocking(io::stderr()),
        };

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .compact()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .is_ok();

        if installed {
            *FILE_GUARD.lock() = Some(guard);
        }
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Flush buffered log output. Events emitted afterwards are dropped by the
/// writer, so call this right before process exit.
pub fn shutdown() {
    FILE_GUARD.lock().take();
}

// ============================================================================
// Allocator event helpers
// ============================================================================

/// Log an address-range reservation
#[inline]
pub fn log_reserve(size: usize, base: *const u8) {
    tracing::trace!(event = "reserve", size_bytes = size, address = ?base, "address range reserved");
}

/// Log an address-range release
#[inline]
pub fn log_release(size: usize, base: *const u8) {
    tracing::trace!(event = "release", size_bytes = size, address = ?base, "address range released");
}

/// Log a commit of physical pages
#[inline]
pub fn log_commit(size: usize, base: *const u8) {
    tracing::trace!(event = "commit", size_bytes = size, address = ?base, "pages committed");
}

/// Log a decommit of physical pages
#[inline]
pub fn log_decommit(size: usize, base: *const u8) {
    tracing::trace!(event = "decommit", size_bytes = size, address = ?base, "pages decommitted");
}

/// Log a failed OS call
pub fn log_os_failure(operation: &str, size: usize, error: &io::Error) {
    tracing::warn!(
        event = "os_failure",
        operation,
        size_bytes = size,
        error = %error,
        "virtual memory operation failed"
    );
}

/// Log arena creation
pub fn log_arena_alloc(index: u32, reserved_bytes: usize, committed_bytes: usize) {
    tracing::debug!(
        event = "arena_alloc",
        slot = index,
        reserved_bytes,
        committed_bytes,
        "arena allocated"
    );
}

/// Log arena release
pub fn log_arena_release(index: u32, name: Option<&str>) {
    tracing::debug!(event = "arena_release", slot = index, name = name.unwrap_or("none"), "arena released");
}

/// Log growth of the registry's slot storage
pub fn log_registry_grow(old_slots: usize, new_slots: usize) {
    tracing::debug!(event = "registry_grow", old_slots, new_slots, "arena registry grown");
}

/// Log pool capacity changes
pub fn log_pool_resize(old_capacity: usize, new_capacity: usize) {
    tracing::debug!(event = "pool_resize", old_capacity, new_capacity, "pool capacity changed");
}

/// Log a flat array length change
pub fn log_array_resize(old_len: usize, new_len: usize, committed_pages: usize) {
    tracing::trace!(event = "array_resize", old_len, new_len, committed_pages, "array resized");
}

/// Log a trim failure that was absorbed (clear keeps working)
pub fn log_shrink_failure(error: &crate::VmemError, cause: &crate::VmemError) {
    tracing::error!(event = "shrink_failed", error = %error, cause = %cause, "arena trim failed");
}
