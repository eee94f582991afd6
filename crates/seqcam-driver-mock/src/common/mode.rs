//! Operational modes for the mock gateway.
//!
//! - **Instant**: Frames only arrive when scripted or triggered; deterministic for unit tests
//! - **Realistic**: Continuous acquisition produces frames at the configured readout rate
//! - **Chaos**: Jittered timing and missed readouts, usually combined with
//!   injected driver errors

/// Operational modes for the mock gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Scripted frames only - for unit tests
    #[default]
    Instant,
    /// Hardware-like frame timing - for integration tests and demos
    Realistic,
    /// Jittered timing with missed readouts, see [`ChaosConfig`]
    Chaos,
}

impl MockMode {
    /// Whether continuous acquisition generates frames on its own.
    pub fn free_running(&self) -> bool {
        matches!(self, MockMode::Realistic | MockMode::Chaos)
    }
}

/// Misbehaviour of a camera in [`MockMode::Chaos`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosConfig {
    /// Probability that a free-running readout is lost. Lost readouts count
    /// as missed images in the capture status.
    pub missed_frame_rate: f64,
    /// Frame interval spread, as a fraction of the interval.
    pub jitter: f64,
    /// Fixed seed for a replayable run.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            missed_frame_rate: 0.1,
            jitter: 0.25,
            seed: None,
        }
    }
}
