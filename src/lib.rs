//! Playlog Reftest - visual-regression testing for game content.
//!
//! This crate provides:
//! - Real-time replay of recorded playlogs against a runtime ([`scheduler`])
//! - Time-bounded execution with salvage screenshots ([`timer`])
//! - A staged execution pipeline with guaranteed cleanup ([`pipeline`])
//! - Pixel comparison of screenshot directories ([`compare`])
//! - A configure hash that skips unchanged entries on update ([`hash`])
//!
//! # Example
//!
//! ```rust,no_run
//! use playlog_reftest::entry;
//! use playlog_reftest::inject::{FileHelperBundler, HelperScriptCache};
//! use playlog_reftest::pipeline::RunnerPipeline;
//! use playlog_reftest::runner::{FramebufferDriver, PassiveScenarioRunner};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let entry = entry::load("tests/title/reftest.entry.json".as_ref())?;
//! let runner = PassiveScenarioRunner::new(FramebufferDriver::new(640, 360));
//! let mut pipeline = RunnerPipeline::new(
//!     Box::new(runner),
//!     HelperScriptCache::new(FileHelperBundler::from_config()),
//! );
//! let output = pipeline.run(&entry).await?;
//! println!("{}: {} screenshots", output.status(), output.screenshots().len());
//! pipeline.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod compare;
pub mod config;
pub mod entry;
pub mod hash;
pub mod inject;
pub mod manifest;
pub mod pipeline;
pub mod playlog;
pub mod runner;
pub mod scheduler;
pub mod staging;
pub mod timer;
pub mod verify;

// Re-export the core engine
pub use compare::{CompareError, DiffPolicy, FileDiff, diff_directory, verify_image};
pub use hash::{ConfigureHash, ConfigureHashStore, compute_configure_hash};
pub use pipeline::RunnerPipeline;
pub use scheduler::{SchedulerError, TickHandlers, replay};
pub use timer::{TimeoutError, with_time_limit, with_time_limit_or_else};

// Re-export entry and result types
pub use entry::{NormalizedReftestEntry, ReftestEntry, TestType};
pub use runner::{ExecutionMode, ReftestOutput, RunnerError, RunnerResult, Screenshot};
pub use verify::{ReftestMode, ReftestResult, ReftestStatus, VerifySettings, run_entry, summarize};
