//! The private working area a run fills with block files.

use crate::error::{CleanupError, EngineError, EngineResult};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Something blocks can be written into.
///
/// [`ScratchDir`] is the real thing; other implementations stand in for
/// devices that can't be reproduced on demand.
pub trait BlockStore {
    /// Sink for the bytes of one block.
    type Block: io::Write;

    /// Where the blocks end up, for reporting.
    fn location(&self) -> &Path;

    /// Opens a new, empty block `index` for writing.
    fn create_block(&mut self, index: u64) -> io::Result<Self::Block>;

    /// Persists a block whose bytes have all been written.
    ///
    /// Returning `Ok` means the data was handed to the storage layer, not
    /// merely buffered in the process.
    fn finish_block(&mut self, block: Self::Block) -> io::Result<()>;

    /// Removes everything the store created.
    fn cleanup(&mut self) -> Result<(), CleanupError>;

    /// Leaves everything in place; the store must not remove it later.
    fn keep(&mut self) {}
}

/// A uniquely named directory under the target path.
///
/// If dropped before [`BlockStore::cleanup`] or [`BlockStore::keep`] was
/// called, the directory tree is removed on a best-effort basis.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    armed: bool,
}

impl ScratchDir {
    const PREFIX: &'static str = ".capacity-check-";

    /// Atomically creates a fresh, empty directory under `parent`.
    pub fn create_in(parent: &Path) -> EngineResult<Self> {
        let path = tempfile::Builder::new()
            .prefix(Self::PREFIX)
            .tempdir_in(parent)
            .map_err(|source| EngineError::ScratchDirCreateFailed {
                path: parent.to_path_buf(),
                source,
            })?
            .keep();
        debug!(?path, "Created scratch directory");
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_path(&self, index: u64) -> PathBuf {
        self.path.join(format!("test_block_{index}.bin"))
    }
}

impl BlockStore for ScratchDir {
    type Block = File;

    fn location(&self) -> &Path {
        &self.path
    }

    fn create_block(&mut self, index: u64) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.block_path(index))
    }

    fn finish_block(&mut self, block: File) -> io::Result<()> {
        block.sync_all()
    }

    fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.armed = false;
        let mut errors: Vec<(PathBuf, io::Error)> = Vec::new();
        match fs::read_dir(&self.path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => {
                            let path = entry.path();
                            if let Err(error) = fs::remove_file(&path) {
                                errors.push((path, error));
                            }
                        }
                        Err(error) => errors.push((self.path.clone(), error)),
                    }
                }
            }
            Err(error) => errors.push((self.path.clone(), error)),
        }
        if errors.is_empty() {
            if let Err(error) = fs::remove_dir(&self.path) {
                errors.push((self.path.clone(), error));
            }
        }

        for (path, error) in &errors {
            warn!(?path, %error, "Could not remove scratch entry");
        }
        let failed = errors.len();
        match errors.into_iter().next() {
            None => {
                debug!(path = ?self.path, "Removed scratch directory");
                Ok(())
            }
            Some((path, source)) => Err(CleanupError {
                path,
                failed,
                source,
            }),
        }
    }

    fn keep(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(error) = fs::remove_dir_all(&self.path) {
                warn!(path = ?self.path, %error, "Could not remove abandoned scratch directory");
            }
        }
    }
}
