//! Collaborators that execute a content.
//!
//! A [`ScenarioRunner`] runs a staged content under a scenario and returns
//! screenshots. A [`Preprocessor`] transforms a staged content into another
//! directory before it runs. An [`AudioExtractor`] renders what the content
//! played as an image. All three are object safe so the pipeline can hold any
//! strategy behind a `Box<dyn _>`.
//!
//! Strategies:
//! - [`PassiveScenarioRunner`] operates a [`RuntimeDriver`] from outside
//! - [`CommandScenarioRunner`] lets an external runtime replay the playlog
//! - [`CommandPreprocessor`] runs an external exporter
//! - [`FramebufferDriver`] is an in-memory runtime for headless use

pub mod command;
pub mod framebuffer;
pub mod passive;
pub mod types;

use futures::future::BoxFuture;
use std::path::{Path, PathBuf};

pub use command::{CommandPreprocessor, CommandScenarioRunner, ExternalCommand};
pub use framebuffer::{DriverCall, Framebuffer, FramebufferDriver};
pub use passive::{PassiveScenarioRunner, RuntimeDriver};
pub use types::{
    ExecutionMode, ReftestOutput, RunnerError, RunnerResult, Screenshot, play_screenshot_name,
    scenario_dir_name, timeout_image_name,
};

/// Executes a content and collects its screenshots
pub trait ScenarioRunner: Send + Sync {
    /// Run the content in `content_dir` under the scenario at `scenario_path`
    /// `play_times` times.
    ///
    /// A mode the runner cannot execute yields
    /// [`ReftestOutput::SkippedUnsupported`]. A play that exceeds its deadline
    /// yields [`ReftestOutput::Timeout`] with one diagnostic image.
    fn run<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
        play_times: u32,
    ) -> BoxFuture<'a, RunnerResult<ReftestOutput>>;

    /// Release whatever the runner installed
    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>>;

    /// Version of the tooling the runner drives
    fn version_info(&self) -> String;
}

/// Transforms a staged content into a new directory
pub trait Preprocessor: Send + Sync {
    /// Write the transformed content to a new directory and return its path
    fn run<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<PathBuf>>;

    /// Release whatever the preprocessor installed
    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>>;

    /// Notification that no more contents will be processed
    fn finish(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn version_info(&self) -> String;
}

/// Renders the audio a content plays as an image
pub trait AudioExtractor: Send + Sync {
    fn run<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
    ) -> BoxFuture<'a, RunnerResult<Screenshot>>;

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>>;
}
