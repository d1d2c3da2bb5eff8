//! Synchronization configuration schema and loader
//!
//! Configuration is stored as YAML in the user's config directory.
//! Default location: ~/.config/spectra-sync/sync.yaml
//!
//! Everything here is fixed at session start: the hub copies the config when it is
//! built and never re-reads it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Default transform window (matches the analyser's default FFT size)
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Smallest and largest accepted transform windows
pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;

/// Default wraparound bound for the frame sequence counter
///
/// Far larger than any plausible number of frames a consumer can miss between wakes,
/// small enough that the counter never grows without bound.
pub const DEFAULT_SEQUENCE_WRAP: u32 = 100_000;

/// Default display refresh rate driving the producer
pub const DEFAULT_REFRESH_RATE_HZ: f64 = 60.0;

/// Default bounded block on the poll fallback path
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Default internal timeout of the async wait driver
///
/// This is also the worst-case stop latency of an async consumer.
pub const DEFAULT_DRIVER_TIMEOUT_MS: u64 = 100;

/// How the consumer wait primitive is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Use an async runtime when one is reachable
    #[default]
    Auto,
    /// Require the async path (degrades to polling with a warning if unavailable)
    ForceAsync,
    /// Always use the bounded-block poll fallback
    ForcePoll,
}

/// Physical layout of the shared magnitude buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// One buffer, written in place. Readers may observe a torn frame.
    #[default]
    Single,
    /// Two buffers and an atomic front index. The writer fills the back buffer and
    /// flips the index after the copy completes.
    Double,
}

/// Root synchronization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Transform window size; the frame length is half of it
    pub fft_size: usize,
    /// Wraparound bound K for the frame sequence
    pub sequence_wrap: u32,
    /// Producer tick rate when driven by the built-in interval clock
    pub refresh_rate_hz: f64,
    /// Wait primitive selection override
    pub wait_mode: WaitMode,
    /// Poll fallback: length of one bounded block
    pub poll_interval_ms: u64,
    /// Async path: internal driver timeout before the wait is re-issued
    pub driver_timeout_ms: u64,
    /// Shared buffer layout
    pub buffer_mode: BufferMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            sequence_wrap: DEFAULT_SEQUENCE_WRAP,
            refresh_rate_hz: DEFAULT_REFRESH_RATE_HZ,
            wait_mode: WaitMode::Auto,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            driver_timeout_ms: DEFAULT_DRIVER_TIMEOUT_MS,
            buffer_mode: BufferMode::Single,
        }
    }
}

impl SyncConfig {
    /// Length L of the shared magnitude buffer
    pub fn frame_len(&self) -> usize {
        self.fft_size / 2
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    /// Period between producer ticks for the built-in interval clock
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_rate_hz)
    }

    /// Check the configuration before any shared state is allocated
    pub fn validate(&self) -> SyncResult<()> {
        if !self.fft_size.is_power_of_two()
            || self.fft_size < MIN_FFT_SIZE
            || self.fft_size > MAX_FFT_SIZE
        {
            return Err(SyncError::InvalidConfig(format!(
                "fft_size must be a power of two in [{}, {}], got {}",
                MIN_FFT_SIZE, MAX_FFT_SIZE, self.fft_size
            )));
        }
        if self.sequence_wrap < 2 {
            return Err(SyncError::InvalidConfig(format!(
                "sequence_wrap must be at least 2, got {}",
                self.sequence_wrap
            )));
        }
        if !self.refresh_rate_hz.is_finite()
            || self.refresh_rate_hz <= 0.0
            || self.refresh_rate_hz > 1000.0
        {
            return Err(SyncError::InvalidConfig(format!(
                "refresh_rate_hz must be in (0, 1000], got {}",
                self.refresh_rate_hz
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.driver_timeout_ms == 0 || self.driver_timeout_ms > 1000 {
            return Err(SyncError::InvalidConfig(format!(
                "driver_timeout_ms must be in [1, 1000], got {}",
                self.driver_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Get the default config file path
///
/// Returns: ~/.config/spectra-sync/sync.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("spectra-sync")
        .join("sync.yaml")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, returns default config.
/// If the file exists but is invalid, logs a warning and returns default config.
pub fn load_config(path: &Path) -> SyncConfig {
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return SyncConfig::default();
    }

    let config = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<SyncConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("load_config: Failed to parse config: {}, using defaults", e);
                return SyncConfig::default();
            }
        },
        Err(e) => {
            log::warn!(
                "load_config: Failed to read config file: {}, using defaults",
                e
            );
            return SyncConfig::default();
        }
    };

    if let Err(e) = config.validate() {
        log::warn!("load_config: {}, using defaults", e);
        return SyncConfig::default();
    }

    log::info!(
        "load_config: Loaded config - FFT size: {}, wrap: {}, wait mode: {:?}, buffer: {:?}",
        config.fft_size,
        config.sequence_wrap,
        config.wait_mode,
        config.buffer_mode
    );
    config
}

/// Save configuration to a YAML file
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &SyncConfig, path: &Path) -> Result<()> {
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    Ok(())
}
