//! Tracing setup
//!
//! Structured logging through `tracing-subscriber`, in pretty, compact or JSON
//! form. `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=seqcam_driver=trace` shows every wait and lock without touching
//! the config file. Initialization is idempotent and safe to call from tests.
//!
//! # Example
//! ```no_run
//! use seqcam::{config::SeqcamConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SeqcamConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(buffers = config.camera.buffer_count, "configured");
//! # Ok(())
//! # }
//! ```

use crate::config::SeqcamConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line and colored, for a terminal
    #[default]
    Pretty,
    /// One plain line per event
    Compact,
    /// One JSON object per event, for log shipping
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    /// Log span creation and close (with busy/idle timings)
    pub span_events: bool,
    /// Source file and line of each event
    pub source_location: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            source_location: false,
        }
    }
}

impl LogSettings {
    /// Settings from the `[logging]` section.
    pub fn from_config(config: &SeqcamConfig) -> Result<Self, String> {
        let level = config
            .logging
            .level
            .parse::<Level>()
            .map_err(|_| format!("invalid log level '{}'", config.logging.level))?;
        Ok(Self {
            level,
            format: config.logging.format,
            ..Default::default()
        })
    }
}

/// Initialize tracing from the `[logging]` section.
pub fn init_from_config(config: &SeqcamConfig) -> Result<(), String> {
    init(&LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` when a global subscriber is already installed.
pub fn init(settings: &LogSettings) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(fmt_layer(settings).with_filter(filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("failed to initialize tracing: {}", e))
            }
        })
}

fn fmt_layer(settings: &LogSettings) -> Box<dyn Layer<Registry> + Send + Sync> {
    let spans = if settings.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(spans)
        .with_file(settings.source_location)
        .with_line_number(settings.source_location)
        .with_thread_names(true);

    match settings.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
