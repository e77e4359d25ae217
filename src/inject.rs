//! Script injection into a staged content.
//!
//! Scripts are prepended to the content's entry script so they run before the
//! content boots. The replay helper is produced once per [`HelperVariant`] by a
//! [`HelperBundler`] and memoized in a [`HelperScriptCache`] owned by whoever
//! drives the pipeline.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::manifest::{GameManifest, HelperVariant, ManifestError};

/// Result type for injection
pub type InjectResult<T> = Result<T, InjectError>;

/// Error types for injection
#[derive(Debug, Error)]
pub enum InjectError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bundler could not produce the helper script
    #[error("Failed to bundle {variant:?} helper: {message}")]
    Bundle {
        variant: HelperVariant,
        message: String,
    },
}

/// Produces the replay helper script for a variant
pub trait HelperBundler: Send + Sync {
    fn bundle(&self, variant: HelperVariant) -> InjectResult<String>;
}

/// Reads prebuilt bundles named `<bundle name>.js` from a directory
#[derive(Debug, Clone)]
pub struct FileHelperBundler {
    dir: PathBuf,
}

impl FileHelperBundler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Bundler reading from the configured helper directory
    pub fn from_config() -> Self {
        Self::new(crate::config::get().execution.helper_dir.clone())
    }

    pub fn bundle_path(&self, variant: HelperVariant) -> PathBuf {
        self.dir.join(format!("{}.js", variant.bundle_name()))
    }
}

impl HelperBundler for FileHelperBundler {
    fn bundle(&self, variant: HelperVariant) -> InjectResult<String> {
        let path = self.bundle_path(variant);
        fs::read_to_string(&path).map_err(|e| InjectError::Bundle {
            variant,
            message: format!("{}: {e}", path.display()),
        })
    }
}

/// Memo of bundled helper scripts, one per variant
///
/// Clones share the same memo.
#[derive(Clone)]
pub struct HelperScriptCache {
    bundler: Arc<dyn HelperBundler>,
    scripts: Arc<Mutex<HashMap<HelperVariant, Arc<str>>>>,
}

impl std::fmt::Debug for HelperScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperScriptCache")
            .field("cached", &self.cached_variants())
            .finish()
    }
}

impl HelperScriptCache {
    pub fn new(bundler: impl HelperBundler + 'static) -> Self {
        Self {
            bundler: Arc::new(bundler),
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Helper script for `variant`, bundling it on first use
    pub fn get_or_bundle(&self, variant: HelperVariant) -> InjectResult<Arc<str>> {
        let mut scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(script) = scripts.get(&variant) {
            return Ok(script.clone());
        }
        debug!(?variant, "bundling replay helper");
        let script: Arc<str> = self.bundler.bundle(variant)?.into();
        scripts.insert(variant, script.clone());
        Ok(script)
    }

    /// Variants bundled so far
    pub fn cached_variants(&self) -> Vec<HelperVariant> {
        self.scripts
            .lock()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// Prepend the replay helper matching the content's runtime
pub fn inject_reftest_helper(dir: &Path, cache: &HelperScriptCache) -> InjectResult<()> {
    let manifest = GameManifest::load(dir)?;
    let script = cache.get_or_bundle(manifest.helper_variant())?;
    prepend_to_entry_script(dir, &manifest, &script)
}

/// Prepend the given script files, joined with newlines in order.
///
/// An empty list leaves the content untouched.
pub fn inject_scripts(dir: &Path, script_paths: &[PathBuf]) -> InjectResult<()> {
    if script_paths.is_empty() {
        return Ok(());
    }
    let sources = script_paths
        .iter()
        .map(|p| {
            fs::read_to_string(p).map_err(|source| InjectError::Io {
                path: p.clone(),
                source,
            })
        })
        .collect::<InjectResult<Vec<_>>>()?;
    let manifest = GameManifest::load(dir)?;
    prepend_to_entry_script(dir, &manifest, &sources.join("\n"))
}

fn prepend_to_entry_script(dir: &Path, manifest: &GameManifest, script: &str) -> InjectResult<()> {
    let path = dir.join(manifest.entry_script_path()?);
    let io_err = |source| InjectError::Io {
        path: path.clone(),
        source,
    };
    let original = fs::read_to_string(&path).map_err(io_err)?;
    fs::write(&path, format!("{script}\n{original}")).map_err(io_err)?;
    debug!(path = %path.display(), bytes = script.len(), "injected script");
    Ok(())
}
