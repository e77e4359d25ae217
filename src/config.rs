//! Configuration management with environment variable support.
//!
//! Every knob the harness reads from the environment lives here, with a
//! default that applies when the variable is unset or unparsable. CLI flags
//! override these values.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REFTEST_THRESHOLD` | Allowed diff ratio for ordinary screenshots | `0` |
//! | `AUDIO_REFTEST_THRESHOLD` | Allowed diff ratio for the audio waveform image | `0.07` |
//! | `REFTEST_PIXEL_THRESHOLD` | Per-pixel colour distance tolerance (0..1) | `0.1` |
//! | `REFTEST_CONTENT_TIME_LIMIT_MS` | Upper bound for one content execution | `300000` |
//! | `REFTEST_TMP_DIR` | Base directory for staged content and scratch output | system temp dir |
//! | `REFTEST_HELPER_DIR` | Directory holding prebuilt replay helper bundles | `./reftest-helper` |
//! | `REFTEST_PLAY_TIMES` | Default number of plays per entry | `2` |
//!
//! # Example
//!
//! ```bash
//! # Loosen the audio comparison on a noisy CI host
//! export AUDIO_REFTEST_THRESHOLD=0.12
//!
//! # Keep staged content on a larger volume
//! export REFTEST_TMP_DIR="/var/tmp/reftest"
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default allowed diff ratio for ordinary screenshots
pub const DEFAULT_IMAGE_DIFF_THRESHOLD: f64 = 0.0;

/// Default allowed diff ratio for the audio waveform image
pub const DEFAULT_AUDIO_DIFF_THRESHOLD: f64 = 0.07;

/// Default per-pixel colour distance tolerance
pub const DEFAULT_PIXEL_THRESHOLD: f64 = 0.1;

/// Default upper bound for one content execution (milliseconds)
pub const DEFAULT_CONTENT_TIME_LIMIT_MS: u64 = 300_000;

/// Default directory holding prebuilt replay helper bundles
pub const DEFAULT_HELPER_DIR: &str = "./reftest-helper";

/// Default number of plays per entry
pub const DEFAULT_PLAY_TIMES: u32 = 2;

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the image diff threshold
pub const ENV_IMAGE_DIFF_THRESHOLD: &str = "REFTEST_THRESHOLD";

/// Environment variable for the audio diff threshold
pub const ENV_AUDIO_DIFF_THRESHOLD: &str = "AUDIO_REFTEST_THRESHOLD";

/// Environment variable for the per-pixel tolerance
pub const ENV_PIXEL_THRESHOLD: &str = "REFTEST_PIXEL_THRESHOLD";

/// Environment variable for the content time limit
pub const ENV_CONTENT_TIME_LIMIT_MS: &str = "REFTEST_CONTENT_TIME_LIMIT_MS";

/// Environment variable for the scratch base directory
pub const ENV_TMP_DIR: &str = "REFTEST_TMP_DIR";

/// Environment variable for the helper bundle directory
pub const ENV_HELPER_DIR: &str = "REFTEST_HELPER_DIR";

/// Environment variable for the default play count
pub const ENV_PLAY_TIMES: &str = "REFTEST_PLAY_TIMES";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for the harness
#[derive(Debug, Clone)]
pub struct Config {
    /// Comparison settings
    pub compare: CompareSettings,
    /// Execution settings
    pub execution: ExecutionSettings,
}

/// Thresholds used when judging screenshots
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareSettings {
    /// Allowed mismatch ratio for ordinary screenshots
    pub image_threshold: f64,
    /// Allowed mismatch ratio for the audio waveform image
    pub audio_threshold: f64,
    /// Per-pixel colour distance tolerance
    pub pixel_threshold: f64,
}

/// Settings that shape a single content execution
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Ceiling for one content execution
    pub content_time_limit: Duration,
    /// Base directory for staged content and scratch output
    pub tmp_dir: PathBuf,
    /// Directory holding prebuilt replay helper bundles
    pub helper_dir: PathBuf,
    /// Default number of plays per entry
    pub play_times: u32,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            compare: CompareSettings::from_env(),
            execution: ExecutionSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            compare: CompareSettings::defaults(),
            execution: ExecutionSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CompareSettings {
    /// Create comparison settings from environment variables
    pub fn from_env() -> Self {
        Self {
            image_threshold: parse_ratio(ENV_IMAGE_DIFF_THRESHOLD)
                .unwrap_or(DEFAULT_IMAGE_DIFF_THRESHOLD),
            audio_threshold: parse_ratio(ENV_AUDIO_DIFF_THRESHOLD)
                .unwrap_or(DEFAULT_AUDIO_DIFF_THRESHOLD),
            pixel_threshold: parse_ratio(ENV_PIXEL_THRESHOLD).unwrap_or(DEFAULT_PIXEL_THRESHOLD),
        }
    }

    /// Create comparison settings with defaults
    pub fn defaults() -> Self {
        Self {
            image_threshold: DEFAULT_IMAGE_DIFF_THRESHOLD,
            audio_threshold: DEFAULT_AUDIO_DIFF_THRESHOLD,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
        }
    }
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl ExecutionSettings {
    /// Create execution settings from environment variables
    pub fn from_env() -> Self {
        Self {
            content_time_limit: Duration::from_millis(
                env::var(ENV_CONTENT_TIME_LIMIT_MS)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CONTENT_TIME_LIMIT_MS),
            ),
            tmp_dir: env::var(ENV_TMP_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            helper_dir: env::var(ENV_HELPER_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_HELPER_DIR)),
            play_times: env::var(ENV_PLAY_TIMES)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_PLAY_TIMES),
        }
    }

    /// Create execution settings with defaults
    pub fn defaults() -> Self {
        Self {
            content_time_limit: Duration::from_millis(DEFAULT_CONTENT_TIME_LIMIT_MS),
            tmp_dir: env::temp_dir(),
            helper_dir: PathBuf::from(DEFAULT_HELPER_DIR),
            play_times: DEFAULT_PLAY_TIMES,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read a ratio in `0..=1` from the environment
fn parse_ratio(var: &str) -> Option<f64> {
    env::var(var).ok().and_then(|s| parse_ratio_str(&s))
}

fn parse_ratio_str(value: &str) -> Option<f64> {
    let ratio: f64 = value.trim().parse().ok()?;
    (0.0..=1.0).contains(&ratio).then_some(ratio)
}

/// Get the compare settings from the environment (convenience function)
pub fn compare_settings() -> CompareSettings {
    get().compare
}

/// Get the scratch base directory (convenience function)
pub fn tmp_dir() -> PathBuf {
    get().execution.tmp_dir.clone()
}

/// Get the content time limit (convenience function)
pub fn content_time_limit() -> Duration {
    get().execution.content_time_limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ratio_accepts_unit_interval() {
        assert_eq!(parse_ratio_str("0"), Some(0.0));
        assert_eq!(parse_ratio_str(" 0.07 "), Some(0.07));
        assert_eq!(parse_ratio_str("1"), Some(1.0));
    }

    #[test]
    fn test_parse_ratio_rejects_out_of_range() {
        assert_eq!(parse_ratio_str("1.5"), None);
        assert_eq!(parse_ratio_str("-0.1"), None);
        assert_eq!(parse_ratio_str("abc"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.compare.audio_threshold, DEFAULT_AUDIO_DIFF_THRESHOLD);
        assert_eq!(config.compare.pixel_threshold, DEFAULT_PIXEL_THRESHOLD);
        assert_eq!(
            config.execution.content_time_limit,
            Duration::from_millis(DEFAULT_CONTENT_TIME_LIMIT_MS)
        );
        assert_eq!(config.execution.play_times, DEFAULT_PLAY_TIMES);
    }
}
