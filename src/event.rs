//! What a run reports back to its driver.

use crate::error::WriteFailure;
use indicatif::HumanBytes;
use std::{fmt, path::PathBuf, time::Duration};

/// Where a run is, or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// The whole block budget was written without error.
    CompletedLimitReached,
    /// A block write failed; everything before it is the proven capacity.
    CompletedWriteFailed,
    /// The driver asked the run to stop.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::CompletedLimitReached => "limit reached",
            RunStatus::CompletedWriteFailed => "write failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What happened to the scratch area at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    /// Left on disk because cleanup was switched off.
    Kept,
    /// Removal was attempted and did not fully succeed.
    Failed(String),
}

/// Final numbers of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub status: RunStatus,
    pub scratch_dir: PathBuf,
    pub cleanup: CleanupOutcome,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} confirmed writable across {} blocks ({})",
            HumanBytes(self.bytes_written),
            self.blocks_written,
            self.status
        )
    }
}

/// One entry in the ordered event stream of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Info(String),
    /// Something went wrong that doesn't affect the result.
    Warning(String),
    /// Block `index` is fully written and synced.
    BlockWritten {
        index: u64,
        size: u64,
        /// Running total including this block.
        bytes_written: u64,
        /// Time spent generating, writing and syncing this block.
        elapsed: Duration,
    },
    /// Block `index` could not be written; the run stops here.
    WriteFailed { index: u64, cause: WriteFailure },
    /// Always the last event of a run.
    Finished(RunSummary),
}

impl ReportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportEvent::Finished(_))
    }
}

/// Renders events as lines of a running log.
impl fmt::Display for ReportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportEvent::Info(message) => write!(f, "[INFO] {message}"),
            ReportEvent::Warning(message) => write!(f, "[WARN] {message}"),
            ReportEvent::BlockWritten {
                index,
                size,
                elapsed,
                ..
            } => {
                let secs = elapsed.as_secs_f64();
                let rate = if secs > 0.0 {
                    (*size as f64 / secs) as u64
                } else {
                    0
                };
                write!(
                    f,
                    "[INFO] Wrote block {index} of size {} ({}/s)",
                    HumanBytes(*size),
                    HumanBytes(rate)
                )
            }
            ReportEvent::WriteFailed { index, cause } => {
                write!(f, "[ERROR] Write failed at block {index}: {cause}")
            }
            ReportEvent::Finished(summary) => write!(f, "[RESULT] {summary}"),
        }
    }
}
