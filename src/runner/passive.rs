//! Passive execution: the harness operates the runtime itself.
//!
//! The playlog is replayed through [`crate::scheduler::replay`]; pointer events
//! go to the [`RuntimeDriver`] and screenshot commands capture its screen.
//! Timing is only as exact as the driver, so contents should not advance on
//! their own between inputs.

use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{
    ExecutionMode, ReftestOutput, RunnerError, RunnerResult, Screenshot, play_screenshot_name,
    timeout_image_name,
};
use super::ScenarioRunner;
use crate::playlog::Playlog;
use crate::scheduler::{self, TickHandlers};
use crate::timer::with_time_limit;

/// A live runtime that can be operated from outside
///
/// Pointer coordinates are absolute content coordinates.
pub trait RuntimeDriver: Send + Sync {
    /// Start (or restart) the content in `content_dir`
    fn launch<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<()>>;

    fn point_down(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>>;

    fn point_move(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>>;

    fn point_up(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>>;

    /// Capture the current screen as PNG bytes
    fn capture(&self) -> BoxFuture<'_, RunnerResult<Vec<u8>>>;

    /// Stop the running content
    fn close(&self) -> BoxFuture<'_, RunnerResult<()>>;

    /// Release the runtime itself
    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn version_info(&self) -> String;
}

impl<D: RuntimeDriver + ?Sized> RuntimeDriver for std::sync::Arc<D> {
    fn launch<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<()>> {
        (**self).launch(content_dir)
    }

    fn point_down(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        (**self).point_down(x, y)
    }

    fn point_move(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        (**self).point_move(x, y)
    }

    fn point_up(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        (**self).point_up(x, y)
    }

    fn capture(&self) -> BoxFuture<'_, RunnerResult<Vec<u8>>> {
        (**self).capture()
    }

    fn close(&self) -> BoxFuture<'_, RunnerResult<()>> {
        (**self).close()
    }

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        (**self).dispose()
    }

    fn version_info(&self) -> String {
        (**self).version_info()
    }
}

/// Runs a content by operating a [`RuntimeDriver`] along the playlog
#[derive(Debug)]
pub struct PassiveScenarioRunner<D> {
    driver: D,
    time_limit: Duration,
}

impl<D: RuntimeDriver> PassiveScenarioRunner<D> {
    /// Runner with the configured content time limit
    pub fn new(driver: D) -> Self {
        Self::with_time_limit(driver, crate::config::content_time_limit())
    }

    pub fn with_time_limit(driver: D, time_limit: Duration) -> Self {
        Self { driver, time_limit }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    async fn run_passive(
        &self,
        content_dir: &Path,
        scenario_path: &Path,
        mode: ExecutionMode,
        play_times: u32,
    ) -> RunnerResult<ReftestOutput> {
        if mode == ExecutionMode::Replay {
            return Ok(ReftestOutput::SkippedUnsupported {
                screenshots: Vec::new(),
            });
        }
        let playlog = Playlog::load(scenario_path)?;
        let screenshots = Mutex::new(Vec::new());

        for play in 0..play_times {
            self.driver.launch(content_dir).await?;
            let handlers = PlayHandlers {
                driver: &self.driver,
                play,
                screenshots: &screenshots,
            };
            let played = with_time_limit(self.time_limit, "content did not end in time", async {
                scheduler::replay(&playlog, &handlers)
                    .await
                    .map_err(RunnerError::from)
            })
            .await;

            match played {
                Ok(()) => self.driver.close().await?,
                Err(RunnerError::Timeout(e)) => {
                    warn!(play, error = %e, "play timed out, capturing the screen");
                    let captured = self.driver.capture().await;
                    self.close_quietly().await;
                    let timeout_image =
                        Screenshot::from_png(timeout_image_name(play, scenario_path), &captured?);
                    return Ok(ReftestOutput::Timeout { timeout_image });
                }
                Err(e) => {
                    self.close_quietly().await;
                    return Err(e);
                }
            }
            info!(play, "play finished");
        }

        let screenshots = screenshots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(ReftestOutput::Succeeded { screenshots })
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.driver.close().await {
            warn!(error = %e, "failed to close runtime");
        }
    }
}

impl<D: RuntimeDriver> ScenarioRunner for PassiveScenarioRunner<D> {
    fn run<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
        play_times: u32,
    ) -> BoxFuture<'a, RunnerResult<ReftestOutput>> {
        Box::pin(self.run_passive(content_dir, scenario_path, mode, play_times))
    }

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        self.driver.dispose()
    }

    fn version_info(&self) -> String {
        self.driver.version_info()
    }
}

/// Forwards scheduler actions of one play to the driver
struct PlayHandlers<'a, D> {
    driver: &'a D,
    play: u32,
    screenshots: &'a Mutex<Vec<Screenshot>>,
}

impl<D: RuntimeDriver> TickHandlers for PlayHandlers<'_, D> {
    type Error = RunnerError;

    fn point_down(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.driver.point_down(x, y)
    }

    fn point_move(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.driver.point_move(x, y)
    }

    fn point_up(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.driver.point_up(x, y)
    }

    fn take_screenshot(&self, file_name: String) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async move {
            let png = self.driver.capture().await?;
            let shot = Screenshot::from_png(play_screenshot_name(self.play, &file_name), &png);
            self.screenshots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(shot);
            Ok(())
        })
    }
}
