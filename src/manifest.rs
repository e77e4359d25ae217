//! Reading the content manifest (`game.json`).
//!
//! Only the parts the harness needs are modelled: the entry script, the asset
//! table, global scripts and the `environment` block that selects the replay
//! helper flavour.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the manifest inside a content directory
pub const MANIFEST_FILE_NAME: &str = "game.json";

/// Asset type whose files carry one suffix per encoded format
const AUDIO_ASSET_TYPE: &str = "audio";

/// Result type for manifest operations
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Error types for manifest operations
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest or a referenced file could not be read
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON or has the wrong shape
    #[error("Invalid manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Neither `main` nor a `mainScene` asset names an entry script
    #[error("Manifest has neither `main` nor a `mainScene` asset")]
    MissingEntryScript,
}

/// Which build of the replay helper a content expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperVariant {
    /// Current runtimes
    Standard,
    /// Contents declaring the 1.x sandbox runtime (or nothing at all)
    LegacyAe1x,
}

impl HelperVariant {
    /// Name of the helper bundle for this variant
    pub fn bundle_name(self) -> &'static str {
        match self {
            HelperVariant::Standard => "reftest-helper",
            HelperVariant::LegacyAe1x => "reftest-helper-for-ae1x",
        }
    }
}

/// Audio encoding hint of an asset
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssetHint {
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
}

/// One entry of the asset table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssetDeclaration {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub hint: Option<AssetHint>,
}

/// Assets are a map keyed by id in most contents and a plain array in some
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AssetTable {
    Map(BTreeMap<String, AssetDeclaration>),
    List(Vec<AssetDeclaration>),
}

impl Default for AssetTable {
    fn default() -> Self {
        AssetTable::Map(BTreeMap::new())
    }
}

impl AssetTable {
    fn iter(&self) -> Box<dyn Iterator<Item = &AssetDeclaration> + '_> {
        match self {
            AssetTable::Map(map) => Box::new(map.values()),
            AssetTable::List(list) => Box::new(list.iter()),
        }
    }

    fn main_scene(&self) -> Option<&AssetDeclaration> {
        match self {
            AssetTable::Map(map) => map.get("mainScene"),
            AssetTable::List(_) => None,
        }
    }
}

/// The parts of `game.json` the harness reads
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameManifest {
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub assets: AssetTable,
    #[serde(default)]
    pub global_scripts: Vec<String>,
    #[serde(default)]
    pub environment: Option<BTreeMap<String, Value>>,
}

impl GameManifest {
    /// Load `game.json` from a content directory
    pub fn load(content_dir: &Path) -> ManifestResult<Self> {
        let path = content_dir.join(MANIFEST_FILE_NAME);
        let text = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestError::Json { path, source })
    }

    /// Relative path of the script that boots the content
    pub fn entry_script_path(&self) -> ManifestResult<&str> {
        self.main
            .as_deref()
            .or_else(|| self.assets.main_scene().map(|a| a.path.as_str()))
            .ok_or(ManifestError::MissingEntryScript)
    }

    /// Every file the manifest references, relative to `content_dir`.
    ///
    /// Audio assets are stored without a suffix; they expand to one path per
    /// extension from their hint, or, when there is no hint, to every file on
    /// disk that shares their stem. The result is deduplicated and sorted.
    pub fn asset_paths(&self, content_dir: &Path) -> ManifestResult<Vec<String>> {
        let mut paths = BTreeSet::new();
        for asset in self.assets.iter() {
            if asset.kind == AUDIO_ASSET_TYPE {
                let extensions = match asset.hint.as_ref().and_then(|h| h.extensions.clone()) {
                    Some(extensions) => extensions,
                    None => probe_extensions(content_dir, &asset.path)?,
                };
                for ext in extensions {
                    paths.insert(format!("{}{}", asset.path, ext));
                }
            } else {
                paths.insert(asset.path.clone());
            }
        }
        paths.extend(self.global_scripts.iter().cloned());
        Ok(paths.into_iter().collect())
    }

    /// Replay helper flavour for this content.
    ///
    /// A missing `sandbox-runtime`, or the value `"1"`, selects the legacy
    /// build.
    pub fn helper_variant(&self) -> HelperVariant {
        let runtime = self
            .environment
            .as_ref()
            .and_then(|env| env.get("sandbox-runtime"));
        match runtime {
            None | Some(Value::Null) => HelperVariant::LegacyAe1x,
            Some(Value::String(s)) if s.is_empty() || s == "1" => HelperVariant::LegacyAe1x,
            Some(Value::Number(n)) if n.as_u64() == Some(1) => HelperVariant::LegacyAe1x,
            Some(_) => HelperVariant::Standard,
        }
    }
}

/// Extensions (with the leading dot) of files named `<asset_path>.*`
fn probe_extensions(content_dir: &Path, asset_path: &str) -> ManifestResult<Vec<String>> {
    let stem_path = content_dir.join(asset_path);
    let Some(stem) = stem_path.file_name().map(|s| s.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let dir = stem_path.parent().unwrap_or(content_dir);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ManifestError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let prefix = format!("{stem}.");
    let mut extensions = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(&prefix) {
            if !rest.is_empty() && !rest.contains('.') {
                extensions.push(format!(".{rest}"));
            }
        }
    }
    extensions.sort();
    Ok(extensions)
}
