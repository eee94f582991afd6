//! Timing configuration for realistic mode.

use std::time::Duration;

/// Timing configuration for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Time between frames while acquiring continuously, in milliseconds
    pub frame_readout_ms: u64,
    /// Extra latency added to every driver call, in milliseconds
    pub call_delay_ms: u64,
}

impl TimingConfig {
    /// Camera at ~30 fps
    pub fn camera() -> Self {
        Self {
            frame_readout_ms: 33,
            call_delay_ms: 0,
        }
    }

    /// Camera at an arbitrary frame rate.
    pub fn with_fps(fps: f64) -> Self {
        let frame_readout_ms = if fps > 0.0 {
            (1000.0 / fps).round().max(1.0) as u64
        } else {
            33
        };
        Self {
            frame_readout_ms,
            call_delay_ms: 0,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_readout_ms)
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_readout_ms: 0,
            call_delay_ms: 0,
        }
    }
}
