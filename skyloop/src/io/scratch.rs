//! The private scratch area holding one run's intermediate artifacts.
//!
//! A [`ScratchArea`] owns its directory. On a normal finish it is deleted or
//! retained according to the run's retention flag; if the run aborts and the
//! area is dropped instead, the same flag decides whether the directory
//! survives (retained untouched) or is removed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::overlay::Phase;
use crate::core::types::{MapArtifact, NdfGroup};

const PREFIX: &str = "skyloop-";

#[derive(Debug)]
pub struct ScratchArea {
    dir: Option<TempDir>,
    path: PathBuf,
    retain: bool,
    next_map: u32,
}

impl ScratchArea {
    /// Create a scratch area under the system temp directory.
    pub fn create(retain: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir()
            .context("create scratch directory")?;
        Ok(Self::from_dir(dir, retain))
    }

    /// Create a scratch area under `parent`.
    pub fn create_in(parent: &Path, retain: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(parent)
            .with_context(|| format!("create scratch directory in {}", parent.display()))?;
        Ok(Self::from_dir(dir, retain))
    }

    fn from_dir(dir: TempDir, retain: bool) -> Self {
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), retain, "scratch area created");
        Self {
            dir: Some(dir),
            path,
            retain,
            next_map: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve a fresh, not yet written map slot.
    pub fn allocate_map(&mut self) -> MapArtifact {
        self.next_map += 1;
        MapArtifact::scratch(self.path.join(format!("map_{:04}", self.next_map)))
    }

    /// Write the overlay text for `phase` and return its path.
    pub fn write_config(&self, phase: Phase, contents: &str) -> Result<PathBuf> {
        let path = self.path.join(phase.file_name());
        fs::write(&path, contents).with_context(|| format!("write config {}", path.display()))?;
        Ok(path)
    }

    /// Write a group indirection file (`groups/<name>.lis`) and return its path.
    pub fn write_group(&self, name: &str, group: &NdfGroup) -> Result<PathBuf> {
        let dir = self.path.join("groups");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{name}.lis"));
        fs::write(&path, group.to_list())
            .with_context(|| format!("write group {}", path.display()))?;
        Ok(path)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn iterations_dir(&self) -> PathBuf {
        self.path.join("iterations")
    }

    /// Directory the run's cleaned time-series are relocated into.
    pub fn cleaned_dir(&self) -> PathBuf {
        self.path.clone()
    }

    /// Release the area at the end of a successful run.
    ///
    /// Returns the directory path when it was retained.
    pub fn finish(mut self) -> Result<Option<PathBuf>> {
        let dir = self
            .dir
            .take()
            .ok_or_else(|| anyhow!("scratch area already released"))?;
        if self.retain {
            return Ok(Some(dir.keep()));
        }
        dir.close()
            .with_context(|| format!("delete scratch directory {}", self.path.display()))?;
        debug!(path = %self.path.display(), "scratch area deleted");
        Ok(None)
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.retain {
            let path = dir.keep();
            debug!(path = %path.display(), "scratch area left in place after failure");
            return;
        }
        if let Err(err) = dir.close() {
            warn!(err = %err, path = %self.path.display(), "failed to delete scratch area");
        }
    }
}
