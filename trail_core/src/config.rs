//! Configuration file support for Trail.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/trail/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub heart_rate: HeartRateConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Position sampler tuning
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    /// Requested interval between location readings (2-5 s)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Readings with horizontal accuracy worse than this are discarded
    #[serde(default = "default_accuracy_threshold_m")]
    pub accuracy_threshold_m: f64,

    #[serde(default = "default_auto_pause_speed_mps")]
    pub auto_pause_speed_mps: f64,

    /// How long speed must stay below the threshold before auto-pausing
    #[serde(default = "default_auto_pause_sustain_secs")]
    pub auto_pause_sustain_secs: u64,

    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// Number of accepted points in the rolling pace window
    #[serde(default = "default_pace_window")]
    pub pace_window: usize,

    /// Maximum points held in memory while the store is failing
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            accuracy_threshold_m: default_accuracy_threshold_m(),
            auto_pause_speed_mps: default_auto_pause_speed_mps(),
            auto_pause_sustain_secs: default_auto_pause_sustain_secs(),
            flush_batch_size: default_flush_batch_size(),
            pace_window: default_pace_window(),
            buffer_cap: default_buffer_cap(),
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn auto_pause_sustain(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_pause_sustain_secs as i64)
    }
}

/// Heart-rate sensor configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeartRateConfig {
    /// Service identifier used to discover a paired device
    #[serde(default = "default_service_id")]
    pub service_id: String,

    /// Resting rate the simulated walk centres on
    #[serde(default = "default_baseline_bpm")]
    pub baseline_bpm: u16,

    #[serde(default = "default_min_bpm")]
    pub min_bpm: u16,

    #[serde(default = "default_max_bpm")]
    pub max_bpm: u16,

    /// Largest single-step change of the simulated walk
    #[serde(default = "default_max_step_bpm")]
    pub max_step_bpm: u16,

    /// Seed for the simulated walk; fixed seeds give reproducible sequences
    #[serde(default)]
    pub seed: u64,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            baseline_bpm: default_baseline_bpm(),
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
            max_step_bpm: default_max_step_bpm(),
            seed: 0,
        }
    }
}

/// Sync queue retry configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Attempts before an operation is marked errored
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Durable store configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Log records after which `compact_if_needed` rewrites a collection
    #[serde(default = "default_compact_after_records")]
    pub compact_after_records: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compact_after_records: default_compact_after_records(),
        }
    }
}

/// Log output configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset, e.g. `warn` or
    /// `trail_core::sync_queue=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("trail")
}

fn default_interval_secs() -> u64 {
    3
}

fn default_accuracy_threshold_m() -> f64 {
    50.0
}

fn default_auto_pause_speed_mps() -> f64 {
    0.5
}

fn default_auto_pause_sustain_secs() -> u64 {
    30
}

fn default_flush_batch_size() -> usize {
    10
}

fn default_pace_window() -> usize {
    5
}

fn default_buffer_cap() -> usize {
    1000
}

fn default_service_id() -> String {
    "0000180d-0000-1000-8000-00805f9b34fb".into()
}

fn default_baseline_bpm() -> u16 {
    70
}

fn default_min_bpm() -> u16 {
    40
}

fn default_max_bpm() -> u16 {
    200
}

fn default_max_step_bpm() -> u16 {
    3
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_delay_secs() -> u64 {
    2
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    15 * 60
}

fn default_compact_after_records() -> usize {
    5000
}

fn default_log_level() -> String {
    "warn".into()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("trail").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the sampler, sensor or queue cannot operate with
    pub fn validate(&self) -> Result<()> {
        let s = &self.sampler;
        if !(2..=5).contains(&s.interval_secs) {
            return Err(Error::Config(format!(
                "sampler.interval_secs must be between 2 and 5, got {}",
                s.interval_secs
            )));
        }
        if s.accuracy_threshold_m <= 0.0 || s.auto_pause_speed_mps <= 0.0 {
            return Err(Error::Config(
                "sampler thresholds must be positive".into(),
            ));
        }
        if s.flush_batch_size == 0 || s.pace_window < 2 {
            return Err(Error::Config(
                "sampler.flush_batch_size must be > 0 and pace_window >= 2".into(),
            ));
        }
        if s.buffer_cap < s.flush_batch_size {
            return Err(Error::Config(
                "sampler.buffer_cap must be at least flush_batch_size".into(),
            ));
        }

        let hr = &self.heart_rate;
        if hr.min_bpm >= hr.max_bpm || !(hr.min_bpm..=hr.max_bpm).contains(&hr.baseline_bpm) {
            return Err(Error::Config(
                "heart_rate.baseline_bpm must lie within min_bpm..=max_bpm".into(),
            ));
        }

        if self.sync.max_attempts == 0 || self.sync.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "sync.max_attempts must be > 0 and backoff_multiplier >= 1.0".into(),
            ));
        }
        Ok(())
    }
}
