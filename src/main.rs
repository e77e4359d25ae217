use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use playlog_reftest::compare::{DiffPolicy, diff_directory_with_threshold, write_diff_images};
use playlog_reftest::config;
use playlog_reftest::entry::{self, NormalizedReftestEntry, TestType, TestTypeSelection};
use playlog_reftest::hash::{ConfigureHashStore, compute_configure_hash};
use playlog_reftest::inject::{FileHelperBundler, HelperScriptCache};
use playlog_reftest::pipeline::RunnerPipeline;
use playlog_reftest::runner::{
    CommandPreprocessor, CommandScenarioRunner, ExternalCommand, FramebufferDriver,
    PassiveScenarioRunner, ScenarioRunner,
};
use playlog_reftest::verify::{self, EntryOutcome, ReftestMode, ReftestResult, VerifySettings};

/// Playlog Reftest - visual-regression testing driven by recorded playlogs
#[derive(Parser, Debug)]
#[command(
    name = "playlog-reftest",
    version,
    about = "Replay playlogs against game content and compare the screenshots with accepted ones",
    after_help = "ENVIRONMENT VARIABLES:\n\
        REFTEST_THRESHOLD               Allowed diff ratio for screenshots\n\
        AUDIO_REFTEST_THRESHOLD         Allowed diff ratio for the audio waveform\n\
        REFTEST_PIXEL_THRESHOLD         Per-pixel colour tolerance\n\
        REFTEST_CONTENT_TIME_LIMIT_MS   Upper bound for one content execution\n\
        REFTEST_TMP_DIR                 Base directory for scratch files\n\
        REFTEST_HELPER_DIR              Directory of prebuilt replay helper bundles\n\
        RUST_LOG                        Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run entries and compare (or update) their screenshots
    Run {
        /// Entry files, or directories searched for reftest.entry.json
        #[arg(required = true)]
        targets: Vec<PathBuf>,

        /// Test types to run
        #[arg(long, value_enum, default_value = "all")]
        test_type: TestTypeSelection,

        /// Update expected images instead of testing
        #[arg(long, conflicts_with = "update_diff")]
        update: bool,

        /// Update expected images of entries whose configuration changed
        #[arg(long)]
        update_diff: bool,

        /// External runtime that replays playlogs ("program args...")
        #[arg(long)]
        runtime_command: Option<String>,

        /// External exporter run on the staged content ("program args...")
        #[arg(long)]
        preprocess_command: Option<String>,

        /// Screen size of the built-in framebuffer runtime (WxH)
        #[arg(long, default_value = "640x360")]
        framebuffer_size: String,

        /// Background of the built-in framebuffer runtime as hex (e.g. "000000")
        #[arg(long, default_value = "000000")]
        framebuffer_background: String,

        /// Allowed diff ratio for screenshots (0 ~ 1)
        #[arg(long, env = "REFTEST_THRESHOLD")]
        threshold: Option<f64>,

        /// Content time limit in milliseconds
        #[arg(long, env = "REFTEST_CONTENT_TIME_LIMIT_MS")]
        time_limit_ms: Option<u64>,

        /// Directory for every diff image
        #[arg(long)]
        diff_dir_path: Option<PathBuf>,

        /// Directory for the diff images of failing screenshots
        #[arg(long)]
        error_diff_dir_path: Option<PathBuf>,

        /// Directory for the screenshot taken when a content times out
        #[arg(long)]
        timeout_error_dir_path: Option<PathBuf>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare two directories of screenshots
    Diff {
        /// Directory of accepted screenshots
        expected: PathBuf,

        /// Directory of produced screenshots
        actual: PathBuf,

        /// Write diff images here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Allowed diff ratio per file (0 ~ 1)
        #[arg(long, env = "REFTEST_THRESHOLD")]
        threshold: Option<f64>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the configure hash of an entry
    Hash {
        /// Entry file
        entry: PathBuf,

        /// Also report whether the stored hash of this test type matches
        #[arg(long, value_enum)]
        test_type: Option<TestType>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            targets,
            test_type,
            update,
            update_diff,
            runtime_command,
            preprocess_command,
            framebuffer_size,
            framebuffer_background,
            threshold,
            time_limit_ms,
            diff_dir_path,
            error_diff_dir_path,
            timeout_error_dir_path,
            json,
        } => {
            let mut entries: Vec<NormalizedReftestEntry> = Vec::new();
            for target in &targets {
                for path in entry::discover(target)? {
                    let loaded = entry::load(&path)
                        .with_context(|| format!("failed to load entry {}", path.display()))?;
                    entries.push(loaded);
                }
            }
            if entries.is_empty() {
                bail!("no reftest.entry.json found under the given targets");
            }

            let compare = config::compare_settings();
            let mut policy = DiffPolicy::from(compare);
            if let Some(threshold) = threshold {
                policy.image_threshold = threshold;
            }
            let settings = VerifySettings {
                mode: if update {
                    ReftestMode::UpdateExpected
                } else if update_diff {
                    ReftestMode::UpdateExpectedOnlyDiff
                } else {
                    ReftestMode::Test
                },
                policy,
                pixel_threshold: compare.pixel_threshold,
                diff_dir: diff_dir_path,
                error_diff_dir: error_diff_dir_path,
                timeout_error_dir: timeout_error_dir_path,
                entry_root: verify::common_root(entries.iter().map(|e| &e.self_path)),
                scratch_dir: config::tmp_dir(),
            };
            let runtime = RuntimeChoice {
                runtime_command,
                preprocess_command,
                framebuffer_size: parse_size(&framebuffer_size)?,
                framebuffer_background: parse_hex_color(&framebuffer_background)?,
                time_limit: time_limit_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(config::content_time_limit),
            };
            let helper_cache = HelperScriptCache::new(FileHelperBundler::from_config());

            let mut results: Vec<ReftestResult> = Vec::new();
            for test_type in test_type.resolve() {
                let mut pipeline = runtime.build(helper_cache.clone()).await?;
                tracing::info!(%test_type, version = %pipeline.version_info(), "start test type");

                let mut outcome = Ok(());
                for entry in &entries {
                    match verify::run_entry(&mut pipeline, entry, test_type, &settings).await {
                        Ok(EntryOutcome::Tested(result)) => results.push(result),
                        Ok(EntryOutcome::Updated) | Ok(EntryOutcome::Unchanged) => {}
                        Err(e) => {
                            outcome = Err(e).with_context(|| {
                                format!("{} ({test_type})", entry.self_path.display())
                            });
                            break;
                        }
                    }
                }
                if let Err(e) = pipeline.finish().await {
                    tracing::warn!(error = %e, "preprocessor finish failed");
                }
                if let Err(e) = pipeline.dispose().await {
                    tracing::warn!(error = %e, "dispose failed");
                }
                outcome?;
            }

            if settings.mode.is_update() {
                println!("Expected images updated for {} entries", entries.len());
                return Ok(());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Reftest completed: {} results", results.len());
                for result in &results {
                    println!(
                        "  [{:?}] {} ({})",
                        result.status, result.name, result.test_type
                    );
                    for diff in &result.file_diffs {
                        println!("    {}: {:.4}", diff.file_name(), diff.difference);
                    }
                    if let Some(path) = &result.timeout_image_path {
                        println!("    timeout image: {}", path.display());
                    }
                }
            }
            verify::summarize(&results, &settings)?;
        }

        Commands::Diff {
            expected,
            actual,
            output,
            threshold,
            json,
        } => {
            let compare = config::compare_settings();
            let mut policy = DiffPolicy::from(compare);
            if let Some(threshold) = threshold {
                policy.image_threshold = threshold;
            }
            let diffs = diff_directory_with_threshold(&expected, &actual, compare.pixel_threshold)?;
            if let Some(dir) = &output {
                write_diff_images(&diffs, dir)?;
            }
            let failures = policy.failures(&diffs);

            if json {
                println!("{}", serde_json::to_string_pretty(&diffs)?);
            } else {
                for diff in &diffs {
                    let mark = if policy.is_failure(diff) { "FAIL" } else { "ok" };
                    println!("  [{mark}] {}: {:.4}", diff.file_name(), diff.difference);
                }
            }
            if !failures.is_empty() {
                bail!(
                    "{} of {} images differ beyond the threshold",
                    failures.len(),
                    diffs.len()
                );
            }
        }

        Commands::Hash {
            entry: entry_path,
            test_type,
        } => {
            let loaded = entry::load(&entry_path)?;
            let hash = compute_configure_hash(&loaded)?;
            println!("{hash}");
            if let Some(test_type) = test_type {
                let store = ConfigureHashStore::new(&loaded.expected_dir, test_type);
                let state = if store.is_unchanged(&hash)? { "unchanged" } else { "changed" };
                println!("{state} since last update ({})", store.path().display());
            }
        }
    }

    Ok(())
}

/// How to execute contents, as chosen on the command line
struct RuntimeChoice {
    runtime_command: Option<String>,
    preprocess_command: Option<String>,
    framebuffer_size: (u32, u32),
    framebuffer_background: [u8; 3],
    time_limit: Duration,
}

impl RuntimeChoice {
    async fn build(&self, helper_cache: HelperScriptCache) -> anyhow::Result<RunnerPipeline> {
        let runner: Box<dyn ScenarioRunner> = match &self.runtime_command {
            Some(line) => {
                let command = ExternalCommand::parse(line)
                    .with_context(|| format!("invalid runtime command '{line}'"))?;
                Box::new(
                    CommandScenarioRunner::new(command)
                        .await
                        .with_content_time_limit(self.time_limit),
                )
            }
            None => {
                let (width, height) = self.framebuffer_size;
                let driver =
                    FramebufferDriver::new(width, height).background(self.framebuffer_background);
                Box::new(PassiveScenarioRunner::with_time_limit(driver, self.time_limit))
            }
        };

        let mut pipeline = RunnerPipeline::new(runner, helper_cache);
        if let Some(line) = &self.preprocess_command {
            let command = ExternalCommand::parse(line)
                .with_context(|| format!("invalid preprocess command '{line}'"))?;
            pipeline = pipeline.with_preprocessor(Box::new(CommandPreprocessor::new(command).await));
        }
        Ok(pipeline)
    }
}

fn parse_size(size: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = size
        .split_once(['x', 'X'])
        .with_context(|| format!("Invalid size '{size}'. Use WxH (e.g., 640x360)"))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn parse_hex_color(hex: &str) -> anyhow::Result<[u8; 3]> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        bail!("Color must be 6 hex digits (e.g., 'ff0000')");
    }
    let r = u8::from_str_radix(&hex[0..2], 16)?;
    let g = u8::from_str_radix(&hex[2..4], 16)?;
    let b = u8::from_str_radix(&hex[4..6], 16)?;
    Ok([r, g, b])
}
