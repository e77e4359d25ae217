//! Test entries (`reftest.entry.json`).
//!
//! An entry names a content, the playlog to drive it with, how to execute it and
//! where its accepted screenshots live. Paths in the file are relative to the
//! file's own directory; [`normalize`] resolves them once so everything
//! downstream works with absolute paths.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::runner::ExecutionMode;

/// Conventional file name of an entry
pub const ENTRY_FILE_NAME: &str = "reftest.entry.json";

/// Result type for entry operations
pub type EntryResult<T> = Result<T, EntryError>;

/// Error types for entry operations
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid entry {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind of scenario an entry replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioKind {
    Playlog,
}

/// Scenario reference of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(rename = "type")]
    pub kind: ScenarioKind,
    pub path: PathBuf,
}

/// A single path or a list of paths
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<PathBuf> {
        match self {
            OneOrMany::One(path) => vec![path],
            OneOrMany::Many(paths) => paths,
        }
    }
}

/// Entry as written on disk
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReftestEntry {
    #[serde(default)]
    pub content_dir_path: Option<PathBuf>,
    pub scenario: Scenario,
    pub execution_mode: ExecutionMode,
    pub expected_dir_path: PathBuf,
    #[serde(default)]
    pub inject_file_path: Option<OneOrMany>,
    #[serde(default)]
    pub enable_audio: Option<bool>,
    #[serde(default)]
    pub play_times: Option<u32>,
}

/// Entry with every path resolved and every default applied
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedReftestEntry {
    /// Path of the entry file itself
    pub self_path: PathBuf,
    pub content_dir: PathBuf,
    pub scenario: Scenario,
    pub execution_mode: ExecutionMode,
    pub expected_dir: PathBuf,
    pub inject_files: Vec<PathBuf>,
    pub enable_audio: bool,
    pub play_times: u32,
}

impl NormalizedReftestEntry {
    /// Name shown in reports: the entry's directory name
    pub fn display_name(&self) -> String {
        self.self_path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.self_path.display().to_string())
    }

    /// Directory holding the accepted screenshots of one test type
    pub fn expected_dir_for(&self, test_type: TestType) -> PathBuf {
        self.expected_dir.join(test_type.as_str())
    }
}

/// Resolve an entry read from `self_path`
pub fn normalize(entry: ReftestEntry, self_path: &Path) -> NormalizedReftestEntry {
    let self_path = std::path::absolute(self_path).unwrap_or_else(|_| self_path.to_path_buf());
    let base = self_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let resolve = |p: &Path| base.join(p);

    NormalizedReftestEntry {
        content_dir: entry
            .content_dir_path
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| base.clone()),
        scenario: Scenario {
            kind: entry.scenario.kind,
            path: resolve(&entry.scenario.path),
        },
        execution_mode: entry.execution_mode,
        expected_dir: resolve(&entry.expected_dir_path),
        inject_files: entry
            .inject_file_path
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|p| resolve(p))
            .collect(),
        enable_audio: entry.enable_audio.unwrap_or(false),
        play_times: entry
            .play_times
            .unwrap_or(crate::config::DEFAULT_PLAY_TIMES),
        self_path,
    }
}

/// Read and normalize the entry file at `path`
pub fn load(path: &Path) -> EntryResult<NormalizedReftestEntry> {
    let text = fs::read_to_string(path).map_err(|source| EntryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entry: ReftestEntry = serde_json::from_str(&text).map_err(|source| EntryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(normalize(entry, path))
}

/// Entry files for a target: the file itself, or every [`ENTRY_FILE_NAME`]
/// below a directory, sorted
pub fn discover(target: &Path) -> EntryResult<Vec<PathBuf>> {
    if !target.is_dir() {
        return Ok(vec![target.to_path_buf()]);
    }
    let mut found = Vec::new();
    let mut pending = vec![target.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let io_err = |source| EntryError::Io {
            path: dir.clone(),
            source,
        };
        for item in fs::read_dir(&dir).map_err(io_err)? {
            let path = item.map_err(io_err)?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().is_some_and(|n| n == ENTRY_FILE_NAME) {
                found.push(path);
            }
        }
    }
    found.sort();
    debug!(target = %target.display(), entries = found.len(), "discovered entries");
    Ok(found)
}

/// The environment an entry is executed in.
///
/// Names the subdirectory of the expected screenshots and the hash file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TestType {
    Sandbox,
    Serve,
    ExportZip,
    ExportHtml,
    Android,
}

impl TestType {
    pub const ALL: [TestType; 5] = [
        TestType::Sandbox,
        TestType::Serve,
        TestType::ExportZip,
        TestType::ExportHtml,
        TestType::Android,
    ];

    /// Every type that runs on a desktop host
    pub const ALL_PC: [TestType; 4] = [
        TestType::Sandbox,
        TestType::Serve,
        TestType::ExportZip,
        TestType::ExportHtml,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Sandbox => "sandbox",
            TestType::Serve => "serve",
            TestType::ExportZip => "export-zip",
            TestType::ExportHtml => "export-html",
            TestType::Android => "android",
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Test types selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TestTypeSelection {
    #[default]
    All,
    AllPc,
    Sandbox,
    Serve,
    ExportZip,
    ExportHtml,
    Android,
}

impl TestTypeSelection {
    pub fn resolve(self) -> Vec<TestType> {
        match self {
            TestTypeSelection::All => TestType::ALL.to_vec(),
            TestTypeSelection::AllPc => TestType::ALL_PC.to_vec(),
            TestTypeSelection::Sandbox => vec![TestType::Sandbox],
            TestTypeSelection::Serve => vec![TestType::Serve],
            TestTypeSelection::ExportZip => vec![TestType::ExportZip],
            TestTypeSelection::ExportHtml => vec![TestType::ExportHtml],
            TestTypeSelection::Android => vec![TestType::Android],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> ReftestEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_normalize_resolves_all_paths() {
        let entry = parse(
            r#"{
                "contentDirPath": "content",
                "scenario": {"type": "playlog", "path": "playlog.json"},
                "executionMode": "passive",
                "expectedDirPath": "expected",
                "injectFilePath": ["inject1.js", "inject2.js"],
                "enableAudio": true,
                "playTimes": 1
            }"#,
        );
        let normalized = normalize(entry, Path::new("/work/tmp/reftest.entry.json"));
        assert_eq!(
            normalized,
            NormalizedReftestEntry {
                self_path: PathBuf::from("/work/tmp/reftest.entry.json"),
                content_dir: PathBuf::from("/work/tmp/content"),
                scenario: Scenario {
                    kind: ScenarioKind::Playlog,
                    path: PathBuf::from("/work/tmp/playlog.json"),
                },
                execution_mode: ExecutionMode::Passive,
                expected_dir: PathBuf::from("/work/tmp/expected"),
                inject_files: vec![
                    PathBuf::from("/work/tmp/inject1.js"),
                    PathBuf::from("/work/tmp/inject2.js"),
                ],
                enable_audio: true,
                play_times: 1,
            }
        );
    }

    #[test]
    fn test_normalize_defaults() {
        let entry = parse(
            r#"{
                "scenario": {"type": "playlog", "path": "playlog.json"},
                "executionMode": "replay",
                "expectedDirPath": "expected"
            }"#,
        );
        let normalized = normalize(entry, Path::new("/work/tmp/reftest.entry.json"));
        assert_eq!(normalized.content_dir, PathBuf::from("/work/tmp"));
        assert!(normalized.inject_files.is_empty());
        assert!(!normalized.enable_audio);
        assert_eq!(normalized.play_times, 2);
        assert_eq!(normalized.display_name(), "tmp");
        assert_eq!(
            normalized.expected_dir_for(TestType::ExportZip),
            PathBuf::from("/work/tmp/expected/export-zip")
        );
    }

    #[test]
    fn test_single_inject_path() {
        let entry = parse(
            r#"{
                "scenario": {"type": "playlog", "path": "p.json"},
                "executionMode": "replay",
                "expectedDirPath": "e",
                "injectFilePath": "inject.js"
            }"#,
        );
        let normalized = normalize(entry, Path::new("/a/reftest.entry.json"));
        assert_eq!(normalized.inject_files, vec![PathBuf::from("/a/inject.js")]);
    }

    #[test]
    fn test_execution_mode_is_required() {
        let result: Result<ReftestEntry, _> = serde_json::from_str(
            r#"{"scenario": {"type": "playlog", "path": "p.json"}, "expectedDirPath": "e"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_discover_finds_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["b", "a/deep"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
            fs::write(dir.path().join(sub).join(ENTRY_FILE_NAME), "{}").unwrap();
        }
        fs::write(dir.path().join("other.json"), "{}").unwrap();

        let found = discover(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![
                dir.path().join("a/deep").join(ENTRY_FILE_NAME),
                dir.path().join("b").join(ENTRY_FILE_NAME),
            ]
        );
        let single = dir.path().join("b").join(ENTRY_FILE_NAME);
        assert_eq!(discover(&single).unwrap(), vec![single.clone()]);
    }

    #[test]
    fn test_test_type_selection() {
        assert_eq!(TestTypeSelection::All.resolve().len(), 5);
        assert!(!TestTypeSelection::AllPc.resolve().contains(&TestType::Android));
        assert_eq!(TestTypeSelection::ExportHtml.resolve(), vec![TestType::ExportHtml]);
        assert_eq!(TestType::ExportHtml.to_string(), "export-html");
    }
}
