//! Strategies backed by external programs.
//!
//! [`CommandScenarioRunner`] hands the staged content and a copy of the
//! playlog to a runtime process that replays the log itself and writes its
//! screenshots as PNG files into an output directory named by the playlog's
//! `init` command. [`CommandPreprocessor`] runs an exporter that writes a
//! transformed content into a fresh directory.

use futures::future::BoxFuture;
use serde_json::json;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::framebuffer::Framebuffer;
use super::types::{
    ExecutionMode, ReftestOutput, RunnerError, RunnerResult, Screenshot, play_screenshot_name,
    timeout_image_name,
};
use super::{Preprocessor, ScenarioRunner};
use crate::playlog::Playlog;
use crate::staging::StagedDir;
use crate::timer::with_time_limit_or_else;

/// Margin added to the playlog's own length before a replay counts as hung
pub const REPLAY_GRACE: Duration = Duration::from_secs(5);

/// Environment variable naming the screenshot output directory for the runtime
pub const ENV_OUTPUT_DIR: &str = "REFTEST_OUTPUT_DIR";

/// Placeholder size when a hung runtime left no image behind
const PLACEHOLDER_SIZE: u32 = 1;

/// An external program plus its fixed leading arguments
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a fixed argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Parse a whitespace separated command line
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: PathBuf::from(program),
            args: parts.map(OsString::from).collect(),
        })
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// `<name>@<first line of --version>`, or `<name>@unknown`
    pub async fn probe_version(&self) -> String {
        let output = self
            .command()
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await;
        let version = match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            _ => None,
        };
        format!("{}@{}", self.name(), version.as_deref().unwrap_or("unknown"))
    }
}

/// Runs a runtime process that replays the playlog on its own
///
/// The process is started as `<program> <args..> <content_dir> <playlog>` with
/// [`ENV_OUTPUT_DIR`] set to the directory it must write screenshots to.
#[derive(Debug)]
pub struct CommandScenarioRunner {
    command: ExternalCommand,
    content_time_limit: Duration,
    tmp_base: PathBuf,
    version: String,
}

impl CommandScenarioRunner {
    /// Runner using the configured time limit and scratch directory
    pub async fn new(command: ExternalCommand) -> Self {
        let config = crate::config::get();
        let version = command.probe_version().await;
        Self {
            command,
            content_time_limit: config.execution.content_time_limit,
            tmp_base: config.execution.tmp_dir.clone(),
            version,
        }
    }

    pub fn with_content_time_limit(mut self, limit: Duration) -> Self {
        self.content_time_limit = limit;
        self
    }

    pub fn with_tmp_base(mut self, tmp_base: impl Into<PathBuf>) -> Self {
        self.tmp_base = tmp_base.into();
        self
    }

    async fn run_replay(
        &self,
        content_dir: &Path,
        scenario_path: &Path,
        mode: ExecutionMode,
        play_times: u32,
    ) -> RunnerResult<ReftestOutput> {
        if mode == ExecutionMode::Passive {
            return Ok(ReftestOutput::SkippedUnsupported {
                screenshots: Vec::new(),
            });
        }
        let playlog = Playlog::load(scenario_path)?;
        let limit = (playlog.finished_time()? + REPLAY_GRACE).min(self.content_time_limit);
        let mut screenshots = Vec::new();

        for play in 0..play_times {
            let output = StagedDir::create(&self.tmp_base, "reftest-output")?;
            let scratch = StagedDir::create(&self.tmp_base, "reftest-")?;
            let options = json!({
                "outputType": "file",
                "outputDir": output.path().to_string_lossy(),
            });
            let playlog_path = playlog.write_with_init_command(options, scratch.path())?;

            let mut cmd = self.command.command();
            cmd.arg(content_dir)
                .arg(&playlog_path)
                .env(ENV_OUTPUT_DIR, output.path())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            debug!(program = %self.command.program.display(), play, "starting runtime");
            let child = Mutex::new(cmd.spawn()?);

            let exited = with_time_limit_or_else(
                limit,
                "content did not end in time",
                async {
                    let status = child.lock().await.wait().await?;
                    if status.success() {
                        Ok(())
                    } else {
                        Err(RunnerError::Process(format!(
                            "{} exited with {status}",
                            self.command.name()
                        )))
                    }
                },
                || async { child.lock().await.kill().await },
            )
            .await;

            match exited {
                Ok(()) => {
                    for (name, png) in collect_pngs(output.path())? {
                        screenshots.push(Screenshot::from_png(play_screenshot_name(play, &name), &png));
                    }
                    info!(play, collected = screenshots.len(), "play finished");
                }
                Err(RunnerError::Timeout(e)) => {
                    warn!(play, error = %e, "runtime timed out, salvaging its last image");
                    let png = match newest_png(output.path())? {
                        Some(png) => png,
                        None => Framebuffer::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE).to_png()?,
                    };
                    let timeout_image =
                        Screenshot::from_png(timeout_image_name(play, scenario_path), &png);
                    return Ok(ReftestOutput::Timeout { timeout_image });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ReftestOutput::Succeeded { screenshots })
    }
}

impl ScenarioRunner for CommandScenarioRunner {
    fn run<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
        play_times: u32,
    ) -> BoxFuture<'a, RunnerResult<ReftestOutput>> {
        Box::pin(self.run_replay(content_dir, scenario_path, mode, play_times))
    }

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn version_info(&self) -> String {
        self.version.clone()
    }
}

/// PNG files in `dir`, sorted by name
fn collect_pngs(dir: &Path) -> RunnerResult<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    for path in png_paths(dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push((name, fs::read(&path)?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Bytes of the most recently modified PNG in `dir`
fn newest_png(dir: &Path) -> RunnerResult<Option<Vec<u8>>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in png_paths(dir)? {
        let modified = fs::metadata(&path)?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified >= *t) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| fs::read(path)).transpose().map_err(RunnerError::from)
}

fn png_paths(dir: &Path) -> RunnerResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "png") {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Runs an exporter as `<program> <args..> -o <output_dir>` inside the content
#[derive(Debug)]
pub struct CommandPreprocessor {
    command: ExternalCommand,
    tmp_base: PathBuf,
    version: String,
}

impl CommandPreprocessor {
    pub async fn new(command: ExternalCommand) -> Self {
        let version = command.probe_version().await;
        Self {
            command,
            tmp_base: crate::config::tmp_dir(),
            version,
        }
    }

    pub fn with_tmp_base(mut self, tmp_base: impl Into<PathBuf>) -> Self {
        self.tmp_base = tmp_base.into();
        self
    }

    async fn export(&self, content_dir: &Path) -> RunnerResult<PathBuf> {
        let output = StagedDir::create(&self.tmp_base, "preprocessed-content")?;
        let out = self
            .command
            .command()
            .arg("-o")
            .arg(output.path())
            .current_dir(content_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(RunnerError::Process(format!(
                "{} exited with {}: {}",
                self.command.name(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        info!(version = %self.version, output = %output.path().display(), "content exported");
        Ok(output.keep(true).path().to_path_buf())
    }
}

impl Preprocessor for CommandPreprocessor {
    fn run<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<PathBuf>> {
        Box::pin(self.export(content_dir))
    }

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn version_info(&self) -> String {
        self.version.clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn playlog(dir: &Path) -> PathBuf {
        let path = dir.join("scenario").join("playlog.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let doc = json!({
            "tickList": [0, 30, []],
            "startPoints": [{"frame": 0, "timestamp": 0, "data": {"fps": 30}}]
        });
        fs::write(&path, doc.to_string()).unwrap();
        path
    }

    fn png() -> Vec<u8> {
        Framebuffer::with_color(2, 2, [1, 2, 3]).to_png().unwrap()
    }

    #[tokio::test]
    async fn test_collects_written_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("shot.png");
        fs::write(&source, png()).unwrap();
        let program = script(
            dir.path(),
            "runtime.sh",
            &format!(
                "grep -q outputDir \"$2\" || exit 3\ncp {0} \"$REFTEST_OUTPUT_DIR/b.png\"\ncp {0} \"$REFTEST_OUTPUT_DIR/a.png\"",
                source.display()
            ),
        );
        let runner = CommandScenarioRunner::new(ExternalCommand::new(&program))
            .await
            .with_tmp_base(dir.path().join("tmp"));

        let out = runner
            .run(dir.path(), &playlog(dir.path()), ExecutionMode::Replay, 2)
            .await
            .unwrap();
        let names: Vec<&str> = out.screenshots().iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec!["try0_a.png", "try0_b.png", "try1_a.png", "try1_b.png"]);
        // scratch and output directories are gone
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_hung_runtime_times_out_with_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            "hang.sh",
            "[ \"$1\" = \"--version\" ] && exit 1\nexec sleep 30",
        );
        let runner = CommandScenarioRunner::new(ExternalCommand::new(&program))
            .await
            .with_tmp_base(dir.path().join("tmp"))
            .with_content_time_limit(Duration::from_millis(200));

        let out = runner
            .run(dir.path(), &playlog(dir.path()), ExecutionMode::Replay, 1)
            .await
            .unwrap();
        match out {
            ReftestOutput::Timeout { timeout_image } => {
                assert_eq!(timeout_image.file_name, "timeout_try0_scenario.png");
                let image = Framebuffer::from_png_bytes(&timeout_image.decode().unwrap()).unwrap();
                assert_eq!(image.width(), PLACEHOLDER_SIZE);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_runtime_is_a_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "fail.sh", "exit 2");
        let runner = CommandScenarioRunner::new(ExternalCommand::new(&program))
            .await
            .with_tmp_base(dir.path().join("tmp"));
        let err = runner
            .run(dir.path(), &playlog(dir.path()), ExecutionMode::Replay, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Process(_)));
    }

    #[tokio::test]
    async fn test_passive_mode_is_skipped() {
        let runner = CommandScenarioRunner::new(ExternalCommand::new("/nonexistent/runtime")).await;
        assert_eq!(runner.version_info(), "runtime@unknown");
        let out = runner
            .run(Path::new("."), Path::new("missing.json"), ExecutionMode::Passive, 1)
            .await
            .unwrap();
        assert_eq!(out.status(), "skipped-unsupported");
    }

    #[tokio::test]
    async fn test_preprocessor_exports_into_new_dir() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("content");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("game.json"), "{}").unwrap();
        let program = script(
            dir.path(),
            "export.sh",
            "[ \"$1\" = \"--version\" ] && { echo 1.2.3; exit 0; }\ncp game.json \"$2/game.json\"",
        );
        let preprocessor = CommandPreprocessor::new(ExternalCommand::new(&program))
            .await
            .with_tmp_base(dir.path().join("tmp"));
        assert_eq!(preprocessor.version_info(), "export.sh@1.2.3");

        let exported = preprocessor.run(&content).await.unwrap();
        assert!(exported.join("game.json").is_file());
        assert_ne!(exported, content);
    }

    #[test]
    fn test_parse_command_line() {
        let cmd = ExternalCommand::parse("node export.js --force").unwrap();
        assert_eq!(cmd.program, PathBuf::from("node"));
        assert_eq!(cmd.args, vec![OsString::from("export.js"), OsString::from("--force")]);
        assert!(ExternalCommand::parse("   ").is_none());
    }
}
