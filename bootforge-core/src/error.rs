//! Error taxonomy for the imaging pipeline.
//!
//! Every failure that leaves the core library is one of these kinds. Transient
//! failures (a single unmount, one formatting strategy) are absorbed by the
//! component that saw them; only exhausted fallbacks and unsafe conditions are
//! surfaced as an [`ImagingError`].

use crate::conflict::ConflictingProcess;
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

/// The error type returned by every fallible operation in `bootforge-core`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImagingError {
    /// Elevation was requested but no credential has been supplied.
    #[error("Elevated privileges are required but no credential is available")]
    CredentialMissing,

    /// The supplied credential was rejected by the elevation tool.
    #[error("Authentication failed: {0}")]
    CredentialInvalid(String),

    /// A subprocess exceeded its deadline and was killed.
    #[error("`{program}` timed out after {after:?} and was killed")]
    Timeout { program: String, after: Duration },

    /// The target device path does not exist.
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// The target device is below the minimum accepted size.
    #[error("Device {device} is too small ({size_bytes} bytes, minimum {min_bytes} bytes)")]
    TooSmall {
        device: String,
        size_bytes: u64,
        min_bytes: u64,
    },

    /// Partitions of the target device are still mounted after unmounting.
    #[error("Device {device} still has mounted partitions: {}", .mounts.join(", "))]
    StillMounted { device: String, mounts: Vec<String> },

    /// Another imaging process is writing to the target and could not be stopped.
    #[error("Conflicting writer(s) detected:\n{}", describe_processes(.0))]
    ConflictingWriter(Vec<ConflictingProcess>),

    /// Every partition/format strategy failed.
    #[error("Formatting failed (last strategy: {strategy}): {stderr}")]
    FormatFailed { strategy: String, stderr: String },

    /// The image could not be written.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The operation was cancelled by the user.
    #[error("Operation cancelled by user")]
    Cancelled,

    /// Another operation already owns the controller.
    #[error("An operation is already in progress")]
    OperationInProgress,

    /// Anything else: I/O errors, spawn failures, poisoned locks.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, ImagingError>;

impl ImagingError {
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self::WriteFailed(msg.into())
    }

    /// Whether this error means the operation must not continue even if a
    /// fallback exists.
    pub fn is_unsafe(&self) -> bool {
        matches!(
            self,
            Self::ConflictingWriter(_)
                | Self::TooSmall { .. }
                | Self::CredentialInvalid(_)
                | Self::CredentialMissing
                | Self::Cancelled
        )
    }
}

impl From<std::io::Error> for ImagingError {
    fn from(err: std::io::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

fn describe_processes(processes: &[ConflictingProcess]) -> String {
    let mut out = String::new();
    for proc in processes {
        let target = proc.target.as_deref().unwrap_or("<unknown target>");
        let _ = writeln!(out, "  PID {} -> {}: {}", proc.pid, target, proc.command);
    }
    out.trim_end().to_string()
}
