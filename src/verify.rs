//! Verifying one entry under one test type, and summarizing a whole run.
//!
//! In test mode the produced screenshots are compared with the expected ones.
//! In the update modes they replace the expected ones, guarded by the
//! configure hash so unchanged entries can be skipped.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::compare::{
    CompareError, DiffPolicy, FileDiff, diff_directory_with_threshold, write_diff_images,
};
use crate::entry::{NormalizedReftestEntry, TestType};
use crate::hash::{ConfigureHashStore, HashError, compute_configure_hash};
use crate::pipeline::RunnerPipeline;
use crate::runner::{ReftestOutput, RunnerError, Screenshot};
use crate::staging::StagedDir;

/// What a run does with the produced screenshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReftestMode {
    /// Compare against the expected screenshots
    #[default]
    Test,
    /// Replace the expected screenshots
    UpdateExpected,
    /// Replace the expected screenshots of entries whose configure hash changed
    UpdateExpectedOnlyDiff,
}

impl ReftestMode {
    pub fn is_update(self) -> bool {
        !matches!(self, ReftestMode::Test)
    }
}

/// Verdict for one entry and test type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReftestStatus {
    Succeeded,
    Failed,
    Skipped,
    Timeout,
}

/// Outcome of testing one entry under one test type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReftestResult {
    /// Entry path relative to the common root of all entries
    pub name: String,
    pub test_type: TestType,
    pub status: ReftestStatus,
    /// Per-file comparison. `target_path` only exists on disk after the run
    /// when a diff directory was configured; otherwise it is a label.
    pub file_diffs: Vec<FileDiff>,
    pub timeout_image_path: Option<PathBuf>,
}

/// Outcome of [`run_entry`]
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Test mode result
    Tested(ReftestResult),
    /// The expected screenshots were rewritten
    Updated,
    /// The configure hash was unchanged, nothing ran
    Unchanged,
}

/// Where verification writes and how it judges
#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub mode: ReftestMode,
    pub policy: DiffPolicy,
    /// Per-pixel colour tolerance
    pub pixel_threshold: f64,
    /// Base of the per-entry diff image directories (every diff)
    pub diff_dir: Option<PathBuf>,
    /// Base of the per-entry diff image directories (failing diffs only)
    pub error_diff_dir: Option<PathBuf>,
    /// Directory for the salvage images of timed-out runs
    pub timeout_error_dir: Option<PathBuf>,
    /// Common root of all entry files; names are relative to it
    pub entry_root: PathBuf,
    /// Base of the scratch directories the screenshots are written to; they
    /// are kept only when a diff directory is set
    pub scratch_dir: PathBuf,
}

impl Default for VerifySettings {
    fn default() -> Self {
        let compare = crate::config::compare_settings();
        Self {
            mode: ReftestMode::Test,
            policy: compare.into(),
            pixel_threshold: compare.pixel_threshold,
            diff_dir: None,
            error_diff_dir: None,
            timeout_error_dir: None,
            entry_root: PathBuf::from("/"),
            scratch_dir: crate::config::tmp_dir(),
        }
    }
}

/// Result type for verification
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Error types for verification
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Expected screenshots cannot be taken from a run that timed out
    #[error("Timeout Error: {name}({test_type}) did not finish, expected images not updated")]
    UpdateTimeout { name: String, test_type: TestType },

    /// Some entries failed or timed out
    #[error("{0}")]
    Failures(String),
}

/// Run one entry under `test_type` and handle its screenshots according to
/// `settings.mode`
pub async fn run_entry(
    pipeline: &mut RunnerPipeline,
    entry: &NormalizedReftestEntry,
    test_type: TestType,
    settings: &VerifySettings,
) -> VerifyResult<EntryOutcome> {
    let name = relative_name(&settings.entry_root, &entry.self_path);
    let expected_dir = entry.expected_dir_for(test_type);

    if settings.mode.is_update() {
        let hash = compute_configure_hash(entry)?;
        let store = ConfigureHashStore::new(&entry.expected_dir, test_type);
        if settings.mode == ReftestMode::UpdateExpectedOnlyDiff && store.is_unchanged(&hash)? {
            info!(entry = %name, %test_type, "skipped, no configure differences");
            return Ok(EntryOutcome::Unchanged);
        }

        info!(entry = %name, %test_type, "start updating");
        let output = pipeline.run(entry).await?;
        if output.is_timeout() {
            return Err(VerifyError::UpdateTimeout { name, test_type });
        }
        remove_dir_if_present(&expected_dir)?;
        write_screenshots(output.screenshots(), &expected_dir)?;
        store.store(&hash)?;
        info!(entry = %name, %test_type, hash = %hash, "updated expected images");
        return Ok(EntryOutcome::Updated);
    }

    info!(entry = %name, %test_type, "start testing");
    let output = pipeline.run(entry).await?;
    info!(entry = %name, %test_type, status = output.status(), "finished run");

    let result = match output {
        ReftestOutput::Timeout { timeout_image } => {
            let timeout_image_path = match &settings.timeout_error_dir {
                Some(dir) => {
                    let image = Screenshot {
                        file_name: format!("{test_type}_{}", timeout_image.file_name),
                        ..timeout_image
                    };
                    write_screenshots(std::slice::from_ref(&image), dir)?;
                    Some(dir.join(&image.file_name))
                }
                None => None,
            };
            ReftestResult {
                name,
                test_type,
                status: ReftestStatus::Timeout,
                file_diffs: Vec::new(),
                timeout_image_path,
            }
        }
        ReftestOutput::SkippedUnsupported { .. } => ReftestResult {
            name,
            test_type,
            status: ReftestStatus::Skipped,
            file_diffs: Vec::new(),
            timeout_image_path: None,
        },
        ReftestOutput::Succeeded { screenshots } => {
            // diff reports point at the produced files, so those runs keep them
            let reporting = settings.diff_dir.is_some() || settings.error_diff_dir.is_some();
            let output_dir = scratch_output_dir(settings, &name, test_type)?.keep(reporting);
            write_screenshots(&screenshots, output_dir.path())?;
            let diffs = diff_directory_with_threshold(
                &expected_dir,
                output_dir.path(),
                settings.pixel_threshold,
            )?;
            let failures = settings.policy.failures(&diffs);
            if let Some(base) = &settings.diff_dir {
                write_diff_images(&diffs, &base.join(&name).join(test_type.as_str()))?;
            }
            if let Some(base) = &settings.error_diff_dir {
                write_diff_images(
                    failures.iter().copied(),
                    &base.join(&name).join(test_type.as_str()),
                )?;
            }
            let status = if failures.is_empty() {
                ReftestStatus::Succeeded
            } else {
                for f in &failures {
                    warn!(file = %f.file_name(), difference = f.difference, "image differs");
                }
                ReftestStatus::Failed
            };
            ReftestResult {
                name,
                test_type,
                status,
                file_diffs: diffs,
                timeout_image_path: None,
            }
        }
    };
    Ok(EntryOutcome::Tested(result))
}

/// Fresh `<scratch>/<name>/<test type>/<millis>` directory, removed on drop
/// unless kept
fn scratch_output_dir(
    settings: &VerifySettings,
    name: &str,
    test_type: TestType,
) -> VerifyResult<StagedDir> {
    let path = settings
        .scratch_dir
        .join(name)
        .join(test_type.as_str())
        .join(chrono::Utc::now().timestamp_millis().to_string());
    fs::create_dir_all(&path).map_err(|source| VerifyError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(StagedDir::adopt(path))
}

fn write_screenshots(screenshots: &[Screenshot], dir: &Path) -> VerifyResult<()> {
    fs::create_dir_all(dir).map_err(|source| VerifyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for shot in screenshots {
        info!(file = %shot.file_name, "save");
        shot.write_to(dir)?;
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> VerifyResult<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(VerifyError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Deepest directory containing every path in `paths`
pub fn common_root<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> PathBuf {
    let mut root: Option<PathBuf> = None;
    for path in paths {
        let dir = path.parent().unwrap_or(path);
        root = Some(match root {
            None => dir.to_path_buf(),
            Some(prev) => prev
                .components()
                .zip(dir.components())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    root.unwrap_or_default()
}

/// Turn failed and timed-out results into one error
pub fn summarize(results: &[ReftestResult], settings: &VerifySettings) -> VerifyResult<()> {
    let label = |r: &&ReftestResult| format!("{}({})", r.name, r.test_type);
    let timeouts: Vec<String> = results
        .iter()
        .filter(|r| r.status == ReftestStatus::Timeout)
        .map(|r| label(&r))
        .collect();
    let failures: Vec<String> = results
        .iter()
        .filter(|r| r.status == ReftestStatus::Failed)
        .map(|r| label(&r))
        .collect();

    if !timeouts.is_empty() {
        let hint = match &settings.timeout_error_dir {
            Some(dir) => format!(" please see {} to confirm detail.", dir.display()),
            None => " please specify --timeout-error-dir-path <path> to confirm detail.".to_string(),
        };
        return Err(VerifyError::Failures(format!(
            "Timeout on \"{}\"{hint}",
            timeouts.join(",")
        )));
    }
    if !failures.is_empty() {
        let hint = match &settings.error_diff_dir {
            Some(dir) => format!(" please see {} to confirm detail.", dir.display()),
            None => " please specify --error-diff-dir-path <path> to confirm detail.".to_string(),
        };
        return Err(VerifyError::Failures(format!(
            "invalid images on \"{}\" (greater than threshold({}%)).{hint}",
            failures.join(", "),
            100.0 * settings.policy.image_threshold
        )));
    }
    Ok(())
}
