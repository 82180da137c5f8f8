//! Shared vocabulary between the controller and its front-ends: the pipeline
//! state, the events emitted while it runs, and the terminal outcome.

use crate::error::{ImagingError, Result};
use crate::image::Checksum;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The pipeline stage of the single process-wide operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Validating,
    Unmounting,
    Wiping,
    Partitioning,
    Formatting,
    Writing,
    Cancelling,
    Succeeded,
    Failed,
}

impl OperationState {
    /// Whether an operation owns the controller in this state.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Unmounting => "unmounting",
            Self::Wiping => "wiping",
            Self::Partitioning => "partitioning",
            Self::Formatting => "formatting",
            Self::Writing => "writing",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A cancellation request shared between the requesting thread and the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns [`ImagingError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ImagingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What to write and where.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub image: PathBuf,
    pub device: PathBuf,
    /// Expected digest of the (decompressed) image, checked before any
    /// destructive stage.
    pub checksum: Option<Checksum>,
    /// Kill conflicting writers instead of aborting straight away.
    pub terminate_conflicts: bool,
}

impl WriteRequest {
    pub fn new(image: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            device: device.into(),
            checksum: None,
            terminate_conflicts: true,
        }
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn terminate_conflicts(mut self, terminate: bool) -> Self {
        self.terminate_conflicts = terminate;
        self
    }
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Succeeded,
    Cancelled,
    Failed {
        /// The stage that was active when the failure surfaced.
        stage: OperationState,
        error: ImagingError,
    },
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed { stage, error } => write!(f, "failed while {stage}: {error}"),
        }
    }
}

/// Notifications sent to the front-end while an operation runs.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    StateChanged(OperationState),
    /// Decompression of a compressed image; `bytes` produced so far.
    Decompressing { bytes: u64 },
    /// Write progress. `percent` is 100 only after the copy tool succeeded.
    Progress { percent: f64, bytes: u64, total: u64 },
    /// A human-readable status line.
    Message(String),
    Finished(OperationOutcome),
}
