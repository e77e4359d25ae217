//! One execution of an entry, from staging to teardown.
//!
//! [`RunnerPipeline::run`] stages the content into a scratch directory,
//! injects scripts, optionally preprocesses it, runs the scenario, optionally
//! renders audio, and removes every directory it created. Each directory is a
//! [`StagedDir`] from the moment it exists, so a failing stage still leaves
//! nothing behind.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::entry::NormalizedReftestEntry;
use crate::inject::{HelperScriptCache, inject_reftest_helper, inject_scripts};
use crate::runner::{
    AudioExtractor, ExecutionMode, Preprocessor, ReftestOutput, RunnerResult, ScenarioRunner,
};
use crate::staging::{StagedDir, copy_content_files};

/// Preprocessor, scenario runner and audio extractor for one test type
pub struct RunnerPipeline {
    runner: Box<dyn ScenarioRunner>,
    preprocessor: Option<Box<dyn Preprocessor>>,
    audio: Option<Box<dyn AudioExtractor>>,
    helper_cache: HelperScriptCache,
    tmp_base: PathBuf,
}

impl std::fmt::Debug for RunnerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerPipeline")
            .field("version", &self.version_info())
            .field("audio", &self.audio.is_some())
            .field("tmp_base", &self.tmp_base)
            .finish()
    }
}

impl RunnerPipeline {
    pub fn new(runner: Box<dyn ScenarioRunner>, helper_cache: HelperScriptCache) -> Self {
        Self {
            runner,
            preprocessor: None,
            audio: None,
            helper_cache,
            tmp_base: crate::config::tmp_dir(),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Box<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_audio_extractor(mut self, audio: Box<dyn AudioExtractor>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Directory under which staged contents are created
    pub fn with_tmp_base(mut self, tmp_base: impl Into<PathBuf>) -> Self {
        self.tmp_base = tmp_base.into();
        self
    }

    /// Execute one entry.
    ///
    /// Any stage error propagates; the staged directories are removed either
    /// way.
    pub async fn run(&mut self, entry: &NormalizedReftestEntry) -> RunnerResult<ReftestOutput> {
        let mut staged = copy_content_files(&entry.content_dir, &self.tmp_base)?;
        if entry.execution_mode == ExecutionMode::Replay {
            inject_reftest_helper(staged.path(), &self.helper_cache)?;
        }
        inject_scripts(staged.path(), &entry.inject_files)?;

        if let Some(preprocessor) = &self.preprocessor {
            let processed = StagedDir::adopt(preprocessor.run(staged.path()).await?);
            // the input is no longer needed once the output exists
            staged = processed;
        }

        info!(contents = %entry.self_path.display(), "running contents");
        info!(scenario = %entry.scenario.path.display(), "using scenario");
        let mut output = self
            .runner
            .run(
                staged.path(),
                &entry.scenario.path,
                entry.execution_mode,
                entry.play_times,
            )
            .await?;

        if entry.enable_audio && !output.is_timeout() {
            if let Some(audio) = &self.audio {
                let shot = audio
                    .run(staged.path(), &entry.scenario.path, entry.execution_mode)
                    .await?;
                output.push_screenshot(shot);
            }
        }

        staged.cleanup()?;
        Ok(output)
    }

    /// Dispose every collaborator concurrently.
    ///
    /// All three are disposed even when one fails; the first failure is
    /// returned.
    pub async fn dispose(self) -> RunnerResult<()> {
        let (preprocessor, audio, runner) = futures::join!(
            async {
                match &self.preprocessor {
                    Some(p) => p.dispose().await,
                    None => Ok(()),
                }
            },
            async {
                match &self.audio {
                    Some(a) => a.dispose().await,
                    None => Ok(()),
                }
            },
            self.runner.dispose(),
        );

        let mut first = None;
        for (name, result) in [
            ("preprocessor", preprocessor),
            ("audio extractor", audio),
            ("scenario runner", runner),
        ] {
            if let Err(e) = result {
                warn!(collaborator = name, error = %e, "dispose failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Notify the preprocessor that no more entries follow
    pub async fn finish(&self) -> RunnerResult<()> {
        match &self.preprocessor {
            Some(p) => p.finish().await,
            None => Ok(()),
        }
    }

    /// `preprocessor:<info|none>, scenarioRunner:<info>`
    pub fn version_info(&self) -> String {
        format!(
            "preprocessor:{}, scenarioRunner:{}",
            self.preprocessor
                .as_ref()
                .map_or_else(|| "none".to_string(), |p| p.version_info()),
            self.runner.version_info()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Scenario, ScenarioKind};
    use futures::future::BoxFuture;
    use crate::inject::{HelperBundler, InjectResult};
    use crate::manifest::HelperVariant;
    use crate::runner::{RunnerError, Screenshot};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct StaticBundler(Arc<AtomicUsize>);

    impl HelperBundler for StaticBundler {
        fn bundle(&self, _variant: HelperVariant) -> InjectResult<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("/* helper */".to_string())
        }
    }

    #[derive(Default)]
    struct Seen {
        dir: Option<PathBuf>,
        entry_script: String,
    }

    struct ProbeRunner {
        seen: Arc<Mutex<Seen>>,
        fail: bool,
        timeout: bool,
        disposed: Arc<AtomicUsize>,
    }

    impl ProbeRunner {
        fn new(seen: &Arc<Mutex<Seen>>) -> Self {
            Self {
                seen: seen.clone(),
                fail: false,
                timeout: false,
                disposed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ScenarioRunner for ProbeRunner {
        fn run<'a>(
            &'a self,
            content_dir: &'a Path,
            _scenario_path: &'a Path,
            _mode: ExecutionMode,
            _play_times: u32,
        ) -> BoxFuture<'a, RunnerResult<ReftestOutput>> {
            Box::pin(async move {
                let mut seen = self.seen.lock().unwrap();
                seen.dir = Some(content_dir.to_path_buf());
                seen.entry_script = fs::read_to_string(content_dir.join("main.js"))?;
                if self.fail {
                    return Err(RunnerError::Process("runtime crashed".into()));
                }
                if self.timeout {
                    return Ok(ReftestOutput::Timeout {
                        timeout_image: Screenshot::from_png("timeout.png", &[1]),
                    });
                }
                Ok(ReftestOutput::Succeeded {
                    screenshots: vec![Screenshot::from_png("a.png", &[1])],
                })
            })
        }

        fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(RunnerError::Process("already gone".into())) })
        }

        fn version_info(&self) -> String {
            "probe@1".to_string()
        }
    }

    /// Copies the staged content to a sibling directory
    struct CopyPreprocessor {
        base: PathBuf,
        input: Arc<Mutex<Option<PathBuf>>>,
    }

    impl Preprocessor for CopyPreprocessor {
        fn run<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<PathBuf>> {
            Box::pin(async move {
                *self.input.lock().unwrap() = Some(content_dir.to_path_buf());
                let out = self.base.join("exported");
                fs::create_dir_all(&out)?;
                for file in ["game.json", "main.js"] {
                    fs::copy(content_dir.join(file), out.join(file))?;
                }
                Ok(out)
            })
        }

        fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn version_info(&self) -> String {
            "copy@0.1".to_string()
        }
    }

    struct FixedAudio;

    impl AudioExtractor for FixedAudio {
        fn run<'a>(
            &'a self,
            _content_dir: &'a Path,
            _scenario_path: &'a Path,
            _mode: ExecutionMode,
        ) -> BoxFuture<'a, RunnerResult<Screenshot>> {
            Box::pin(async { Ok(Screenshot::from_png("audio.png", &[2])) })
        }

        fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn entry(dir: &Path, mode: ExecutionMode) -> NormalizedReftestEntry {
        let content = dir.join("content");
        fs::create_dir_all(&content).unwrap();
        fs::write(
            content.join("game.json"),
            json!({
                "main": "main.js",
                "assets": {"main": {"type": "script", "path": "main.js"}},
                "environment": {"sandbox-runtime": "3"}
            })
            .to_string(),
        )
        .unwrap();
        fs::write(content.join("main.js"), "game();").unwrap();
        fs::write(dir.join("inject.js"), "/* injected */").unwrap();
        NormalizedReftestEntry {
            self_path: dir.join("reftest.entry.json"),
            content_dir: content,
            scenario: Scenario {
                kind: ScenarioKind::Playlog,
                path: dir.join("playlog.json"),
            },
            execution_mode: mode,
            expected_dir: dir.join("expected"),
            inject_files: vec![dir.join("inject.js")],
            enable_audio: true,
            play_times: 2,
        }
    }

    fn cache() -> (HelperScriptCache, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (HelperScriptCache::new(StaticBundler(count.clone())), count)
    }

    #[tokio::test]
    async fn test_replay_injects_helper_then_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (cache, bundled) = cache();
        let mut pipeline = RunnerPipeline::new(Box::new(ProbeRunner::new(&seen)), cache)
            .with_tmp_base(dir.path().join("tmp"));

        let e = entry(dir.path(), ExecutionMode::Replay);
        pipeline.run(&e).await.unwrap();
        pipeline.run(&e).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.entry_script,
            "/* injected */\n/* helper */\ngame();"
        );
        assert_eq!(bundled.load(Ordering::SeqCst), 1);
        assert!(!seen.dir.as_ref().unwrap().exists());
        // the original content is untouched
        assert_eq!(fs::read_to_string(e.content_dir.join("main.js")).unwrap(), "game();");
    }

    #[tokio::test]
    async fn test_passive_skips_helper() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (cache, bundled) = cache();
        let mut pipeline = RunnerPipeline::new(Box::new(ProbeRunner::new(&seen)), cache)
            .with_tmp_base(dir.path().join("tmp"));

        let mut e = entry(dir.path(), ExecutionMode::Passive);
        e.inject_files.clear();
        pipeline.run(&e).await.unwrap();

        assert_eq!(bundled.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap().entry_script, "game();");
    }

    #[tokio::test]
    async fn test_staged_dir_removed_when_runner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut runner = ProbeRunner::new(&seen);
        runner.fail = true;
        let (cache, _) = cache();
        let mut pipeline =
            RunnerPipeline::new(Box::new(runner), cache).with_tmp_base(dir.path().join("tmp"));

        let result = pipeline.run(&entry(dir.path(), ExecutionMode::Passive)).await;
        assert!(matches!(result, Err(RunnerError::Process(_))));
        assert!(!seen.lock().unwrap().dir.as_ref().unwrap().exists());
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_preprocessed_dir_replaces_staged_dir() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let input = Arc::new(Mutex::new(None));
        let (cache, _) = cache();
        let mut pipeline = RunnerPipeline::new(Box::new(ProbeRunner::new(&seen)), cache)
            .with_preprocessor(Box::new(CopyPreprocessor {
                base: dir.path().to_path_buf(),
                input: input.clone(),
            }))
            .with_tmp_base(dir.path().join("tmp"));

        pipeline.run(&entry(dir.path(), ExecutionMode::Passive)).await.unwrap();

        let ran_in = seen.lock().unwrap().dir.clone().unwrap();
        assert_eq!(ran_in, dir.path().join("exported"));
        assert!(!ran_in.exists());
        assert!(!input.lock().unwrap().as_ref().unwrap().exists());
        assert_eq!(
            pipeline.version_info(),
            "preprocessor:copy@0.1, scenarioRunner:probe@1"
        );
    }

    #[tokio::test]
    async fn test_audio_appended_unless_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (cache, _) = cache();
        let mut pipeline = RunnerPipeline::new(Box::new(ProbeRunner::new(&seen)), cache.clone())
            .with_audio_extractor(Box::new(FixedAudio))
            .with_tmp_base(dir.path().join("tmp"));
        let e = entry(dir.path(), ExecutionMode::Passive);

        let out = pipeline.run(&e).await.unwrap();
        let names: Vec<&str> = out.screenshots().iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "audio.png"]);

        let mut no_audio = e.clone();
        no_audio.enable_audio = false;
        assert_eq!(pipeline.run(&no_audio).await.unwrap().screenshots().len(), 1);

        let mut runner = ProbeRunner::new(&seen);
        runner.timeout = true;
        let mut timing_out = RunnerPipeline::new(Box::new(runner), cache)
            .with_audio_extractor(Box::new(FixedAudio))
            .with_tmp_base(dir.path().join("tmp"));
        assert!(timing_out.run(&e).await.unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_dispose_reaches_every_collaborator() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let runner = ProbeRunner::new(&seen);
        let disposed = runner.disposed.clone();
        let (cache, _) = cache();
        let pipeline =
            RunnerPipeline::new(Box::new(runner), cache).with_audio_extractor(Box::new(FixedAudio));

        assert_eq!(pipeline.version_info(), "preprocessor:none, scenarioRunner:probe@1");
        assert!(pipeline.dispose().await.is_err());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }
}
