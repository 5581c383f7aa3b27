//! Error types for the heap monitor.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, HeapwatchError>;

/// Errors raised by the heap monitor.
///
/// None of these are fatal for a running monitor: [`crate::HeapMonitor`] logs them and keeps sampling.
#[derive(Debug, Error)]
pub enum HeapwatchError {
    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot or configuration (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Process memory counters could not be read.
    #[error("failed to read memory counters: {0}")]
    MetricsRead(String),

    /// [`crate::init_symbol_table`] was never called.
    #[error("symbol table is not initialized")]
    SymbolTableUninitialized,

    /// The scheduler task has already exited.
    #[error("monitor is no longer running")]
    MonitorStopped,

    /// The scheduler task panicked or was cancelled.
    #[error("monitor task failed: {0}")]
    Task(String),
}

impl HeapwatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
