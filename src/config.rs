//! Parameters of a single capacity test run.

use crate::error::{EngineError, EngineResult};
use std::{fs, path::PathBuf};

/// Block size used when the driver doesn't ask for one: 100 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 100 * 1024 * 1024;

/// Immutable description of a run, supplied once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Existing directory under which the scratch area is created.
    pub target_path: PathBuf,
    /// Bytes per block file. Must be non-zero.
    pub block_size: u64,
    /// Ceiling on the bytes written; `None` writes until the medium refuses.
    pub max_total_bytes: Option<u64>,
    /// Remove the scratch area when the run ends.
    pub cleanup_on_finish: bool,
    /// Seed for the block contents. A random one is picked if unset.
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_total_bytes: None,
            cleanup_on_finish: true,
            seed: None,
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn max_total_bytes(mut self, limit: impl Into<Option<u64>>) -> Self {
        self.max_total_bytes = limit.into();
        self
    }

    /// Leave the block files in place after the run. Only useful for diagnosis.
    pub fn keep_files(mut self) -> Self {
        self.cleanup_on_finish = false;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the numeric parameters and computes how many blocks may be written.
    ///
    /// The limit is floored to whole blocks: a 1 GiB limit with 300 MiB
    /// blocks allows 3 blocks (900 MiB). Writing a partial block would
    /// prove nothing the whole blocks didn't, so the remainder is dropped
    /// on purpose.
    pub fn budget(&self) -> EngineResult<BlockBudget> {
        if self.block_size == 0 {
            return Err(EngineError::InvalidConfig(
                "block size must be at least 1 byte".to_string(),
            ));
        }
        match self.max_total_bytes {
            None => Ok(BlockBudget::Unbounded),
            Some(limit) if limit < self.block_size => Err(EngineError::InvalidConfig(format!(
                "limit of {limit} bytes is smaller than one block of {} bytes",
                self.block_size
            ))),
            Some(limit) => Ok(BlockBudget::Limited(limit / self.block_size)),
        }
    }

    /// Checks that the target is an existing directory we could write into.
    pub(crate) fn validate_target(&self) -> EngineResult<()> {
        let invalid = |reason: &str| EngineError::InvalidTarget {
            path: self.target_path.clone(),
            reason: reason.to_string(),
        };
        let metadata = fs::metadata(&self.target_path).map_err(|e| invalid(&e.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid("not a directory"));
        }
        if metadata.permissions().readonly() {
            return Err(invalid("directory is read-only"));
        }
        Ok(())
    }
}

/// How many blocks a run may write.
///
/// "No limit" is its own state rather than a huge sentinel count, so that
/// comparisons never depend on the magnitude of the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBudget {
    Unbounded,
    Limited(u64),
}

impl BlockBudget {
    /// Whether another block may be written after `blocks_written` blocks.
    pub fn allows(&self, blocks_written: u64) -> bool {
        match self {
            BlockBudget::Unbounded => true,
            BlockBudget::Limited(max) => blocks_written < *max,
        }
    }

    /// Total bytes the budget permits, if bounded.
    pub fn total_bytes(&self, block_size: u64) -> Option<u64> {
        match self {
            BlockBudget::Unbounded => None,
            BlockBudget::Limited(max) => max.checked_mul(block_size),
        }
    }
}
