//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! A configuration declares the sampling cadence, the tabular sink, an
//! optional external gate channel, and one or more output datasets. Each
//! dataset names its logged channels, its ring window (`before`/`after`),
//! and the trigger sources that arm it.

use serde::Deserialize;
use serde::de::Error;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::capture::trigger::Direction;
use crate::error::Result;
use crate::provider::AlarmSeverity;
use crate::sink::ArrayLayout;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub gate: Option<GateConfig>,
    #[serde(default, rename = "dataset")]
    pub datasets: Vec<DatasetConfig>,
}

/// Sampling loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Number of timed-out reads tolerated before the process exits.
    /// Zero means unlimited.
    #[serde(default)]
    pub error_budget: u64,
}

/// Tabular sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_sink_directory")]
    pub directory: String,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub array_layout: ArrayLayout,

    #[serde(default = "default_marker_file")]
    pub marker_file: String,
}

/// External gating condition: a scalar channel read every tick.
/// A zero or unreadable value fails the gate and aborts in-flight captures.
#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    pub channel: String,

    #[serde(default = "default_touch_on_abort")]
    pub touch_on_abort: bool,
}

/// One output dataset: logged channels, ring window, trigger sources
#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub name: String,

    /// Pre-trigger samples retained in the ring.
    #[serde(default = "default_before")]
    pub before: usize,

    /// Post-trigger samples captured before the flush.
    #[serde(default = "default_after")]
    pub after: usize,

    /// When set, every source's holdoff is derived from the capture window
    /// so captures can never overlap. Per-source `holdoff_ms` is ignored.
    #[serde(default = "default_auto_holdoff")]
    pub auto_holdoff: bool,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default, rename = "trigger")]
    pub triggers: Vec<TriggerConfig>,
}

/// One logged channel
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    pub name: String,

    #[serde(default)]
    pub kind: ChannelKindConfig,

    /// Element count for array channels. Scalars must leave this at 1.
    #[serde(default = "default_elements")]
    pub elements: usize,

    /// Optional multiplicative scale applied to read values.
    #[serde(default)]
    pub scale: Option<f64>,

    #[serde(default)]
    pub units: Option<String>,

    /// Optional readback alias recorded in the page schema.
    #[serde(default)]
    pub readback: Option<String>,
}

/// Channel shape as declared in configuration
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKindConfig {
    #[default]
    Scalar,
    Array,
}

/// One trigger source, tagged by kind
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerConfig {
    /// Fires on a severity edge into one of the enabled severities.
    Alarm {
        channel: String,
        severities: Vec<AlarmSeverity>,
        /// Feed this source from an async subscription mailbox instead of
        /// the polled snapshot severity.
        #[serde(default)]
        subscribe: bool,
        #[serde(default)]
        holdoff_ms: u64,
        #[serde(default)]
        script: Option<String>,
    },
    /// Fires when the value crosses `level` in the configured direction.
    Transition {
        channel: String,
        level: f64,
        #[serde(default)]
        direction: Direction,
        #[serde(default)]
        auto_rearm: bool,
        #[serde(default)]
        holdoff_ms: u64,
        #[serde(default)]
        script: Option<String>,
    },
    /// Fires when the value deviates from a rolling baseline by more than
    /// `threshold` (absolute if positive, fraction of baseline if negative,
    /// disabled if zero).
    Glitch {
        channel: String,
        threshold: f64,
        #[serde(default = "default_baseline_samples")]
        baseline_samples: usize,
        #[serde(default)]
        auto_reset: bool,
        #[serde(default)]
        holdoff_ms: u64,
        #[serde(default)]
        script: Option<String>,
    },
}

impl TriggerConfig {
    /// Channel name watched by this source.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            TriggerConfig::Alarm { channel, .. } => channel,
            TriggerConfig::Transition { channel, .. } => channel,
            TriggerConfig::Glitch { channel, .. } => channel,
        }
    }

    /// Configured fixed holdoff in milliseconds (ignored under auto holdoff).
    #[must_use]
    pub fn holdoff_ms(&self) -> u64 {
        match self {
            TriggerConfig::Alarm { holdoff_ms, .. } => *holdoff_ms,
            TriggerConfig::Transition { holdoff_ms, .. } => *holdoff_ms,
            TriggerConfig::Glitch { holdoff_ms, .. } => *holdoff_ms,
        }
    }

    /// Attached shell-command string, if any.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        match self {
            TriggerConfig::Alarm { script, .. } => script.as_deref(),
            TriggerConfig::Transition { script, .. } => script.as_deref(),
            TriggerConfig::Glitch { script, .. } => script.as_deref(),
        }
    }
}

// Default value functions
fn default_interval_ms() -> u64 { 100 }
fn default_io_timeout_ms() -> u64 { 100 }

fn default_sink_directory() -> String { "./pages".to_string() }
fn default_file_prefix() -> String { "capture".to_string() }
fn default_marker_file() -> String { "heartbeat".to_string() }

fn default_touch_on_abort() -> bool { true }

fn default_before() -> usize { 10 }
fn default_after() -> usize { 10 }
fn default_auto_holdoff() -> bool { true }

fn default_elements() -> usize { 1 }
fn default_baseline_samples() -> usize { 32 }

fn config_err(msg: impl std::fmt::Display) -> crate::error::GlitchLoggerError {
    crate::error::GlitchLoggerError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use glitch_logger::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range or
    /// the dataset/trigger layout is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.sampling.interval_ms == 0 || self.sampling.interval_ms > 60000 {
            return Err(config_err("interval_ms must be between 1 and 60000"));
        }

        if self.sampling.io_timeout_ms == 0 || self.sampling.io_timeout_ms > 10000 {
            return Err(config_err("io_timeout_ms must be between 1 and 10000"));
        }

        if self.sink.directory.is_empty() {
            return Err(config_err("sink directory cannot be empty"));
        }

        if self.sink.file_prefix.is_empty() {
            return Err(config_err("sink file_prefix cannot be empty"));
        }

        if let Some(gate) = &self.gate {
            if gate.channel.is_empty() {
                return Err(config_err("gate channel cannot be empty"));
            }
        }

        if self.datasets.is_empty() {
            return Err(config_err("at least one [[dataset]] is required"));
        }

        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.is_empty() {
                return Err(config_err("dataset name cannot be empty"));
            }

            if !names.insert(dataset.name.as_str()) {
                return Err(config_err(format!(
                    "duplicate dataset name '{}'", dataset.name
                )));
            }

            // Ring capacity is before + 1 + after and is never resized.
            if dataset.before + 1 + dataset.after > 100_000 {
                return Err(config_err(format!(
                    "dataset '{}': ring depth (before + 1 + after) must not exceed 100000",
                    dataset.name
                )));
            }

            if dataset.channels.is_empty() {
                return Err(config_err(format!(
                    "dataset '{}' must log at least one channel", dataset.name
                )));
            }

            for channel in &dataset.channels {
                if channel.name.is_empty() {
                    return Err(config_err(format!(
                        "dataset '{}': channel name cannot be empty", dataset.name
                    )));
                }

                if channel.elements == 0 {
                    return Err(config_err(format!(
                        "channel '{}': elements must be greater than 0", channel.name
                    )));
                }

                if channel.kind == ChannelKindConfig::Scalar && channel.elements != 1 {
                    return Err(config_err(format!(
                        "channel '{}': scalar channels must have elements = 1", channel.name
                    )));
                }

                if let Some(scale) = channel.scale {
                    if scale == 0.0 || !scale.is_finite() {
                        return Err(config_err(format!(
                            "channel '{}': scale must be finite and non-zero", channel.name
                        )));
                    }
                }
            }

            if dataset.triggers.is_empty() {
                return Err(config_err(format!(
                    "dataset '{}' must define at least one trigger", dataset.name
                )));
            }

            for trigger in &dataset.triggers {
                if trigger.channel().is_empty() {
                    return Err(config_err(format!(
                        "dataset '{}': trigger channel cannot be empty", dataset.name
                    )));
                }

                if trigger.holdoff_ms() > 3_600_000 {
                    return Err(config_err(format!(
                        "dataset '{}': holdoff_ms must not exceed 3600000", dataset.name
                    )));
                }

                match trigger {
                    TriggerConfig::Alarm { severities, .. } => {
                        if severities.is_empty() {
                            return Err(config_err(format!(
                                "dataset '{}': alarm trigger needs at least one severity",
                                dataset.name
                            )));
                        }
                    }
                    TriggerConfig::Transition { level, .. } => {
                        if !level.is_finite() {
                            return Err(config_err(format!(
                                "dataset '{}': transition level must be finite", dataset.name
                            )));
                        }
                    }
                    TriggerConfig::Glitch { threshold, baseline_samples, .. } => {
                        if !threshold.is_finite() {
                            return Err(config_err(format!(
                                "dataset '{}': glitch threshold must be finite", dataset.name
                            )));
                        }

                        if *baseline_samples == 0 {
                            return Err(config_err(format!(
                                "dataset '{}': baseline_samples must be greater than 0",
                                dataset.name
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Every distinct channel name the provider must connect: logged
    /// channels, trigger channels, and the gate channel.
    #[must_use]
    pub fn all_channel_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();

        let mut push = |name: &str| {
            if seen.insert(name.to_string()) {
                names.push(name.to_string());
            }
        };

        for dataset in &self.datasets {
            for channel in &dataset.channels {
                push(&channel.name);
            }
            for trigger in &dataset.triggers {
                push(trigger.channel());
            }
        }

        if let Some(gate) = &self.gate {
            push(&gate.channel);
        }

        names
    }
}
