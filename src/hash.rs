//! Configure hash: a fingerprint of everything that shapes an entry's output.
//!
//! The digest covers the entry file, the scenario, `game.json` and every file
//! the manifest references. When it is unchanged since the expected images were
//! last written, regenerating them would produce the same result, so an update
//! run may skip the entry.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::entry::{NormalizedReftestEntry, TestType};
use crate::manifest::{GameManifest, MANIFEST_FILE_NAME, ManifestError};

/// Directory under the expected dir holding the hash files
pub const HASH_DIR_NAME: &str = "__hash__";

/// Result type for hash operations
pub type HashResult<T> = Result<T, HashError>;

/// Error types for hash operations
#[derive(Debug, Error)]
pub enum HashError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigureHash(String);

impl ConfigureHash {
    fn from_digest(bytes: &[u8]) -> Self {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            use std::fmt::Write as _;
            let _ = write!(&mut hex, "{byte:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint an entry: entry file, scenario, `game.json`, then every
/// referenced asset in sorted path order
pub fn compute_configure_hash(entry: &NormalizedReftestEntry) -> HashResult<ConfigureHash> {
    let mut hasher = Sha256::new();
    let manifest_path = entry.content_dir.join(MANIFEST_FILE_NAME);
    for path in [&entry.self_path, &entry.scenario.path, &manifest_path] {
        hasher.update(read(path)?);
    }

    let manifest = GameManifest::load(&entry.content_dir)?;
    let assets = manifest.asset_paths(&entry.content_dir)?;
    for asset in &assets {
        hasher.update(read(&entry.content_dir.join(asset))?);
    }
    let hash = ConfigureHash::from_digest(&hasher.finalize());
    debug!(entry = %entry.self_path.display(), assets = assets.len(), %hash, "computed configure hash");
    Ok(hash)
}

fn read(path: &Path) -> HashResult<Vec<u8>> {
    fs::read(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Stored hash of one entry and test type, at
/// `<expected>/__hash__/<test type>.hash.txt`
#[derive(Debug, Clone)]
pub struct ConfigureHashStore {
    path: PathBuf,
}

impl ConfigureHashStore {
    pub fn new(expected_dir: &Path, test_type: TestType) -> Self {
        Self {
            path: expected_dir
                .join(HASH_DIR_NAME)
                .join(format!("{}.hash.txt", test_type.as_str())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored digest, if any
    pub fn load(&self) -> HashResult<Option<ConfigureHash>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(ConfigureHash(text.trim().to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(HashError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// True only when a digest is stored and equals `hash`
    pub fn is_unchanged(&self, hash: &ConfigureHash) -> HashResult<bool> {
        Ok(self.load()?.as_ref() == Some(hash))
    }

    pub fn store(&self, hash: &ConfigureHash) -> HashResult<()> {
        let io_err = |source| HashError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&self.path, hash.as_str()).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry;
    use serde_json::json;

    fn fixture(dir: &Path) -> NormalizedReftestEntry {
        fs::create_dir_all(dir.join("content/audio")).unwrap();
        fs::write(
            dir.join("content/game.json"),
            json!({
                "main": "main.js",
                "assets": {
                    "main": {"type": "script", "path": "main.js"},
                    "bgm": {"type": "audio", "path": "audio/bgm"}
                }
            })
            .to_string(),
        )
        .unwrap();
        fs::write(dir.join("content/main.js"), "console.log(1);").unwrap();
        fs::write(dir.join("content/audio/bgm.ogg"), [1u8, 2, 3]).unwrap();
        fs::write(dir.join("playlog.json"), "{}").unwrap();
        let entry_path = dir.join("reftest.entry.json");
        fs::write(
            &entry_path,
            json!({
                "contentDirPath": "content",
                "scenario": {"type": "playlog", "path": "playlog.json"},
                "executionMode": "passive",
                "expectedDirPath": "expected"
            })
            .to_string(),
        )
        .unwrap();
        entry::load(&entry_path).unwrap()
    }

    #[test]
    fn test_hash_is_stable_and_tracks_assets() {
        let dir = tempfile::tempdir().unwrap();
        let entry = fixture(dir.path());

        let first = compute_configure_hash(&entry).unwrap();
        assert_eq!(first.as_str().len(), 64);
        assert_eq!(compute_configure_hash(&entry).unwrap(), first);

        // probed audio files are part of the fingerprint
        fs::write(dir.path().join("content/audio/bgm.ogg"), [9u8]).unwrap();
        assert_ne!(compute_configure_hash(&entry).unwrap(), first);
    }

    #[test]
    fn test_missing_asset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let entry = fixture(dir.path());
        fs::remove_file(dir.path().join("content/main.js")).unwrap();
        assert!(matches!(
            compute_configure_hash(&entry),
            Err(HashError::Io { .. })
        ));
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigureHashStore::new(dir.path(), TestType::ExportHtml);
        assert!(store.path().ends_with("__hash__/export-html.hash.txt"));

        let hash = ConfigureHash::from_digest(&[0xab, 0x01]);
        assert_eq!(hash.as_str(), "ab01");
        assert!(!store.is_unchanged(&hash).unwrap());

        store.store(&hash).unwrap();
        assert!(store.is_unchanged(&hash).unwrap());
        assert!(!store.is_unchanged(&ConfigureHash::from_digest(&[0xcd])).unwrap());
    }
}
