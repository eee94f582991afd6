//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/seqcam.toml`; a missing file is not an error)
//! 3. Environment variables prefixed with `SEQCAM_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use seqcam::config::SeqcamConfig;
//!
//! let config = SeqcamConfig::load()?;
//! config.validate()?;
//! println!("buffers: {}", config.camera.buffer_count);
//! # Ok::<(), seqcam::config::ConfigError>(())
//! ```

use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use seqcam_core::AcquisitionMode;
use seqcam_driver::{CaptureSettings, MAX_BUFFER_COUNT, SUPPORTED_BITS_PER_PIXEL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/seqcam.toml";
pub const ENV_PREFIX: &str = "SEQCAM_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeqcamConfig {
    pub camera: CameraConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

/// Capture sequence setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Buffers in the capture sequence (1..=64)
    pub buffer_count: usize,
    /// Pixel depth of image memory
    pub bits_per_pixel: u32,
    /// continuous or single_shot
    pub mode: AcquisitionMode,
}

/// Event wait settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-wait timeout for the frame event in milliseconds
    pub frame_timeout_ms: u32,
    /// Pause between a completed wait and the next one (0 = re-arm immediately)
    pub rearm_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            buffer_count: settings.buffer_count,
            bits_per_pixel: settings.bits_per_pixel,
            mode: settings.mode,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            frame_timeout_ms: settings.frame_timeout_ms,
            rearm_delay_ms: settings.rearm_delay.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl SeqcamConfig {
    /// Load from `config/seqcam.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// Example override: `SEQCAM_CAMERA__BUFFER_COUNT=8`
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SeqcamConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level '{}' must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.camera.buffer_count == 0 || self.camera.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::Invalid(format!(
                "camera.buffer_count {} must be in 1..={}",
                self.camera.buffer_count, MAX_BUFFER_COUNT
            )));
        }

        if !SUPPORTED_BITS_PER_PIXEL.contains(&self.camera.bits_per_pixel) {
            return Err(ConfigError::Invalid(format!(
                "camera.bits_per_pixel {} must be one of: {:?}",
                self.camera.bits_per_pixel, SUPPORTED_BITS_PER_PIXEL
            )));
        }

        if self.events.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "events.frame_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Driver-level settings for a capture session.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            buffer_count: self.camera.buffer_count,
            bits_per_pixel: self.camera.bits_per_pixel,
            mode: self.camera.mode,
            frame_timeout_ms: self.events.frame_timeout_ms,
            rearm_delay: Duration::from_millis(self.events.rearm_delay_ms),
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
