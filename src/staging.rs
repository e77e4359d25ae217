//! Staged content directories with scoped cleanup.
//!
//! Every directory the pipeline works in is a [`StagedDir`]:
//! - Unique directory under a configurable base (`REFTEST_TMP_DIR`)
//! - Removed when the guard drops, unless explicitly kept
//! - Holds only the files the content manifest references

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::manifest::{GameManifest, MANIFEST_FILE_NAME, ManifestError};

/// Name prefix of directories holding staged content
pub const STAGED_CONTENT_PREFIX: &str = "reftest-tmp-content";

/// A scratch directory that is deleted when dropped
#[derive(Debug)]
pub struct StagedDir {
    path: PathBuf,
    keep: bool,
}

impl StagedDir {
    /// Create a fresh, uniquely named directory under `base`
    pub fn create(base: &Path, prefix: &str) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
        Ok(Self {
            path: dir.keep(),
            keep: false,
        })
    }

    /// Take ownership of an existing directory (e.g. one a preprocessor wrote)
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: false,
        }
    }

    /// Set whether to keep the directory after the guard drops
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Path of the directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now, reporting failures
    pub fn cleanup(mut self) -> io::Result<()> {
        let result = remove_if_present(&self.path);
        self.keep = true;
        result
    }
}

impl AsRef<Path> for StagedDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match remove_if_present(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged directory"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staged directory"),
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Error types for staging
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Failed to stage {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Copy `game.json` and every file it references from `content_dir` into a
/// new staged directory under `tmp_base`
pub fn copy_content_files(content_dir: &Path, tmp_base: &Path) -> Result<StagedDir, StagingError> {
    let manifest = GameManifest::load(content_dir)?;
    let staged = StagedDir::create(tmp_base, STAGED_CONTENT_PREFIX).map_err(|source| {
        StagingError::Copy {
            path: tmp_base.to_path_buf(),
            source,
        }
    })?;

    copy_one(content_dir, staged.path(), MANIFEST_FILE_NAME)?;
    let assets = manifest.asset_paths(content_dir)?;
    for asset in &assets {
        copy_one(content_dir, staged.path(), asset)?;
    }
    debug!(
        from = %content_dir.display(),
        to = %staged.path().display(),
        files = assets.len() + 1,
        "staged content"
    );
    Ok(staged)
}

fn copy_one(from_dir: &Path, to_dir: &Path, relative: &str) -> Result<(), StagingError> {
    let source_path = from_dir.join(relative);
    let target_path = to_dir.join(relative);
    let copy = || -> io::Result<()> {
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source_path, &target_path)?;
        Ok(())
    };
    copy().map_err(|source| StagingError::Copy {
        path: source_path.clone(),
        source,
    })
}
