//! # Vigil Error Types
//!
//! Every fallible operation in the update engine returns [`VigilError`].
//! Each variant carries enough context to be reported through the
//! notification sink without further decoration.
//!
//! ## Error Categories
//!
//! - **Transient**: network copy glitches, file locks, mount hiccups
//! - **Critical section**: service control failures once the swap started
//! - **Recovery**: states the recovery engine cannot heal by itself
//! - **Configuration**: invalid or missing settings
//! - **System**: everything else (I/O, IPC, internal)

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::fs::CopyFailure;

/// Higher-level classification used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Bounded-retry failures that were exhausted
    Transient,
    /// Failures raised while services are stopped or being restarted
    CriticalSection,
    /// Nothing left to roll back to
    Recovery,
    /// Invalid settings
    Configuration,
    /// I/O, IPC and internal failures
    System,
}

/// Result type for all engine operations.
pub type VigilResult<T> = Result<T, VigilError>;

#[derive(Debug, Error)]
pub enum VigilError {
    /// A required file or directory does not exist
    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// Wrapped I/O failure with the operation that triggered it
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// Path involved, if any
        path: Option<PathBuf>,
        /// Short description of the operation ("copy", "create staging directory", ...)
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Verified copy gave up after exhausting its attempts
    #[error(
        "Verified copy from {} to {} failed after {attempts} attempts: {failure}",
        .from.display(),
        .to.display()
    )]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        attempts: u32,
        failure: CopyFailure,
    },

    /// Files under a root stayed locked past the sweep budget
    #[error("{} is still locked after {sweeps} sweeps", .locked.display())]
    FilesLocked { locked: PathBuf, sweeps: u32 },

    /// Network location could not be mounted
    #[error("Failed to mount {remote}: {reason}")]
    Mount { remote: String, reason: String },

    /// A single unit operation failed
    #[error("Unit '{unit}' failed to {operation}: {reason}")]
    Unit {
        unit: String,
        operation: String,
        reason: String,
    },

    /// Stopping a unit failed on every attempt
    #[error("Unable to stop '{unit}' after {attempts} attempts: {last_error}")]
    UnitStop {
        unit: String,
        attempts: u32,
        last_error: String,
    },

    /// Starting a unit failed on every attempt
    #[error("Unable to start '{unit}' after {attempts} attempts: {last_error}")]
    UnitStart {
        unit: String,
        attempts: u32,
        last_error: String,
    },

    /// Units did not all report running within the probe budget
    #[error("Units not running after {attempts} probes: {}", .units.join(", "))]
    UnitsNotRunning { units: Vec<String>, attempts: u32 },

    /// The known-good executable is missing, recovery has nothing to restore
    #[error("Known-good copy is missing: {}", .path.display())]
    KnownGoodMissing { path: PathBuf },

    /// Readiness or client-connected channel failure
    #[error("Handshake on '{channel}' failed: {reason}")]
    Handshake { channel: String, reason: String },

    /// No observer attached before the client timeout
    #[error("No client connected within {} ms", .waited.as_millis())]
    ClientTimeout { waited: Duration },

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl VigilError {
    /// Wraps an I/O error, turning `NotFound` on a known path into [`VigilError::NotFound`].
    pub fn io(path: Option<PathBuf>, operation: &str, source: io::Error) -> Self {
        match path {
            Some(path) if source.kind() == io::ErrorKind::NotFound => VigilError::NotFound { path },
            path => VigilError::Io {
                path,
                operation: operation.to_string(),
                source,
            },
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        VigilError::Config {
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            VigilError::CopyFailed { .. }
            | VigilError::FilesLocked { .. }
            | VigilError::Mount { .. }
            | VigilError::ClientTimeout { .. } => ErrorCategory::Transient,
            VigilError::UnitStop { .. }
            | VigilError::UnitStart { .. }
            | VigilError::UnitsNotRunning { .. } => ErrorCategory::CriticalSection,
            VigilError::KnownGoodMissing { .. } => ErrorCategory::Recovery,
            VigilError::Config { .. } => ErrorCategory::Configuration,
            VigilError::NotFound { .. }
            | VigilError::Io { .. }
            | VigilError::Unit { .. }
            | VigilError::Handshake { .. } => ErrorCategory::System,
        }
    }
}
