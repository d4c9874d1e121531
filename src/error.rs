//! Error types for the capacity test engine.
//!
//! Only setup problems are errors in the `Result` sense. A failing block
//! write is the answer the test is looking for, so it is carried as a
//! [`WriteFailure`] inside an event instead of being propagated.

use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Errors that prevent a run from starting (or from being handed to a worker).
#[derive(Error, Debug)]
pub enum EngineError {
    /// Block size or limit are unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target path is missing, not a directory or read-only.
    #[error("Invalid target {path:?}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    /// The filesystem refused to create the scratch directory.
    #[error("Could not create a scratch directory under {path:?}: {source}")]
    ScratchDirCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The engine is already driving a run.
    #[error("A capacity test is already running on this engine")]
    AlreadyRunning,

    /// The worker thread could not be started.
    #[error("Could not start the worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// The worker thread unwound before producing a summary.
    #[error("The worker thread panicked")]
    WorkerPanicked,
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Rough classification of a failed block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The medium reported that it is full (or the user's quota is exhausted).
    OutOfSpace,
    /// Any other I/O error: device gone, permission revoked, media error...
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::OutOfSpace => f.write_str("out of space"),
            FailureKind::Io => f.write_str("I/O error"),
        }
    }
}

/// ENOSPC on every unix we care about.
const ENOSPC: i32 = 28;
/// EDQUOT on Linux.
const EDQUOT: i32 = 122;

/// The cause of a block write failure, detached from the [`io::Error`] so
/// that it can be cloned into events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct WriteFailure {
    pub kind: FailureKind,
    pub io_kind: io::ErrorKind,
    pub os_code: Option<i32>,
    pub message: String,
}

impl From<&io::Error> for WriteFailure {
    fn from(error: &io::Error) -> Self {
        let os_code = error.raw_os_error();
        let kind = match os_code {
            Some(ENOSPC) => FailureKind::OutOfSpace,
            Some(EDQUOT) if cfg!(target_os = "linux") => FailureKind::OutOfSpace,
            // "disk full" on macOS:
            _ if error.kind() == io::ErrorKind::WriteZero => FailureKind::OutOfSpace,
            _ => FailureKind::Io,
        };
        Self {
            kind,
            io_kind: error.kind(),
            os_code,
            message: error.to_string(),
        }
    }
}

impl From<io::Error> for WriteFailure {
    fn from(error: io::Error) -> Self {
        Self::from(&error)
    }
}

/// Removing the scratch area did not fully succeed. Never changes a run's status.
#[derive(Error, Debug)]
#[error("Could not remove {failed} scratch entries, first was {path:?}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    pub failed: usize,
    #[source]
    pub source: io::Error,
}
