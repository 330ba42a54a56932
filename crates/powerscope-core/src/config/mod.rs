//! Configuration parsing and management.
//!
//! powerscope reads an optional TOML file with a `[collector]` section that
//! controls how `powermetrics` is launched and stopped, and a `[report]`
//! section that controls where run reports are written. Every field has a
//! default, so an empty file (or no file at all) is a valid configuration.
//!
//! ```toml
//! [collector]
//! binary = "powermetrics"
//! privilege_wrapper = "sudo"
//! sample_interval_ms = 100
//! grace_period = "2s"
//!
//! [report]
//! output_dir = "runs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest accepted `max_record_bytes`. A single powermetrics record is
/// several KiB; anything below this would discard every record.
pub const MIN_RECORD_BYTES: usize = 1024;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerscopeConfig {
    /// Collector settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Run report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

impl PowerscopeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.collector.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// How the telemetry subprocess is launched, probed, and stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Telemetry binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Program used to gain privileges without a password prompt. An empty
    /// string runs the binary directly (for example when already root).
    #[serde(default = "default_privilege_wrapper")]
    pub privilege_wrapper: String,

    /// Sampling interval passed to the telemetry binary, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Upper bound for the availability probe.
    #[serde(default = "default_probe_timeout")]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// How long `stop()` waits after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Delay between spawning the subprocess and checking whether it has
    /// already exited.
    #[serde(default = "default_startup_check")]
    #[serde(with = "humantime_serde")]
    pub startup_check: Duration,

    /// Records larger than this are discarded without being buffered.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

fn default_binary() -> PathBuf {
    PathBuf::from("powermetrics")
}

fn default_privilege_wrapper() -> String {
    "sudo".to_string()
}

const fn default_sample_interval_ms() -> u64 {
    100
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(2)
}

const fn default_startup_check() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_record_bytes() -> usize {
    1024 * 1024
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            privilege_wrapper: default_privilege_wrapper(),
            sample_interval_ms: default_sample_interval_ms(),
            probe_timeout: default_probe_timeout(),
            grace_period: default_grace_period(),
            startup_check: default_startup_check(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl CollectorConfig {
    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a zero sampling interval, an
    /// empty binary path, or a record limit below [`MIN_RECORD_BYTES`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "collector.sample_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.binary.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "collector.binary must not be empty".to_string(),
            ));
        }
        if self.max_record_bytes < MIN_RECORD_BYTES {
            return Err(ConfigError::Validation(format!(
                "collector.max_record_bytes must be at least {MIN_RECORD_BYTES}"
            )));
        }
        Ok(())
    }

    /// The privilege wrapper, or `None` when the binary runs directly.
    #[must_use]
    pub fn wrapper(&self) -> Option<&str> {
        let wrapper = self.privilege_wrapper.trim();
        (!wrapper.is_empty()).then_some(wrapper)
    }
}

/// Where run reports go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Directory for `<run_id>.json` reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Pretty-print report JSON.
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

const fn default_pretty() -> bool {
    true
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            pretty: default_pretty(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
