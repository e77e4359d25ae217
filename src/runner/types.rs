// Core types shared by scenario runners, preprocessors and audio extractors

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::inject::InjectError;
use crate::playlog::PlaylogError;
use crate::scheduler::SchedulerError;
use crate::staging::StagingError;
use crate::timer::TimeoutError;

/// How a scenario drives the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// The playlog is fed into the runtime, which replays it itself
    Replay,
    /// The harness operates the content from outside following the playlog
    Passive,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Replay => "replay",
            ExecutionMode::Passive => "passive",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured image, PNG bytes stored as base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub file_name: String,
    pub base64: String,
}

impl Screenshot {
    /// Wrap PNG bytes
    pub fn from_png(file_name: impl Into<String>, png: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            base64: STANDARD.encode(png),
        }
    }

    /// Decoded PNG bytes
    pub fn decode(&self) -> RunnerResult<Vec<u8>> {
        STANDARD
            .decode(&self.base64)
            .map_err(|e| RunnerError::Capture(format!("{}: invalid base64: {e}", self.file_name)))
    }

    /// Write the decoded image as `<dir>/<file_name>`, creating `dir`
    pub fn write_to(&self, dir: &Path) -> RunnerResult<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(&self.file_name), self.decode()?)?;
        Ok(())
    }
}

/// What a scenario execution produced
#[derive(Debug, Clone, PartialEq)]
pub enum ReftestOutput {
    /// Screenshots in arrival order
    Succeeded { screenshots: Vec<Screenshot> },
    /// The runner cannot execute this mode
    SkippedUnsupported { screenshots: Vec<Screenshot> },
    /// The content did not finish in time; one diagnostic image
    Timeout { timeout_image: Screenshot },
}

impl ReftestOutput {
    /// Short status label
    pub fn status(&self) -> &'static str {
        match self {
            ReftestOutput::Succeeded { .. } => "succeeded",
            ReftestOutput::SkippedUnsupported { .. } => "skipped-unsupported",
            ReftestOutput::Timeout { .. } => "timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReftestOutput::Timeout { .. })
    }

    /// Screenshots of a finished or skipped run; empty for a timeout
    pub fn screenshots(&self) -> &[Screenshot] {
        match self {
            ReftestOutput::Succeeded { screenshots }
            | ReftestOutput::SkippedUnsupported { screenshots } => screenshots,
            ReftestOutput::Timeout { .. } => &[],
        }
    }

    /// Append a screenshot; a timeout output is left as is
    pub fn push_screenshot(&mut self, screenshot: Screenshot) {
        match self {
            ReftestOutput::Succeeded { screenshots }
            | ReftestOutput::SkippedUnsupported { screenshots } => screenshots.push(screenshot),
            ReftestOutput::Timeout { .. } => {}
        }
    }
}

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error types for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A live execution exceeded its deadline
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Playlog error: {0}")]
    Playlog(#[from] PlaylogError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Injection error: {0}")]
    Inject(#[from] InjectError),

    /// An external runtime or tool failed
    #[error("Process error: {0}")]
    Process(String),

    /// The runtime could not be operated or captured
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<SchedulerError<RunnerError>> for RunnerError {
    fn from(err: SchedulerError<RunnerError>) -> Self {
        match err {
            SchedulerError::Playlog(e) => RunnerError::Playlog(e),
            SchedulerError::Handler(e) => e,
        }
    }
}

/// Last directory name of the scenario file's parent, used to label timeout
/// images
pub fn scenario_dir_name(scenario_path: &Path) -> String {
    scenario_path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// File name of the salvage image for a timed-out play
pub fn timeout_image_name(play: u32, scenario_path: &Path) -> String {
    format!("timeout_try{play}_{}.png", scenario_dir_name(scenario_path))
}

/// File name of a screenshot taken during a play
pub fn play_screenshot_name(play: u32, file_name: &str) -> String {
    format!("try{play}_{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_serde() {
        let mode: ExecutionMode = serde_json::from_str("\"passive\"").unwrap();
        assert_eq!(mode, ExecutionMode::Passive);
        assert_eq!(serde_json::to_string(&ExecutionMode::Replay).unwrap(), "\"replay\"");
    }

    #[test]
    fn test_screenshot_base64_roundtrip() {
        let shot = Screenshot::from_png("a.png", &[0x89, 0x50, 0x4E, 0x47]);
        assert_eq!(shot.base64, "iVBORw==");
        assert_eq!(shot.decode().unwrap(), vec![0x89, 0x50, 0x4E, 0x47]);

        let broken = Screenshot {
            file_name: "b.png".to_string(),
            base64: "***".to_string(),
        };
        assert!(matches!(broken.decode(), Err(RunnerError::Capture(_))));
    }

    #[test]
    fn test_timeout_image_name_uses_scenario_dir() {
        let path = Path::new("/tests/content-a/playlog.json");
        assert_eq!(timeout_image_name(1, path), "timeout_try1_content-a.png");
        assert_eq!(play_screenshot_name(0, "x.png"), "try0_x.png");
    }

    #[test]
    fn test_push_screenshot_ignores_timeout() {
        let image = Screenshot::from_png("t.png", b"x");
        let mut out = ReftestOutput::Timeout {
            timeout_image: image.clone(),
        };
        out.push_screenshot(image.clone());
        assert!(out.screenshots().is_empty());

        let mut out = ReftestOutput::Succeeded {
            screenshots: vec![],
        };
        out.push_screenshot(image);
        assert_eq!(out.screenshots().len(), 1);
        assert_eq!(out.status(), "succeeded");
    }
}
