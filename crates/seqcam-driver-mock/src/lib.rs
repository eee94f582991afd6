//! Mock driver gateway for seqcam
//!
//! This crate provides a simulated sequence-capture driver for testing the
//! capture core without a camera. [`MockGateway`] implements
//! [`seqcam_core::DriverGateway`] with real heap-backed image memory.
//!
//! # Modes
//!
//! - [`MockMode::Instant`] - frames only arrive when triggered or scripted
//! - [`MockMode::Realistic`] - free-running at the configured frame rate
//! - [`MockMode::Chaos`] - free-running with jitter and missed readouts
//!   ([`ChaosConfig`]), usually combined with [`ErrorConfig`]
//!
//! # Example
//!
//! ```rust,ignore
//! use seqcam_driver_mock::{MockGateway, MockMode, TimingConfig};
//!
//! let gateway = MockGateway::builder()
//!     .mode(MockMode::Realistic)
//!     .timing_config(TimingConfig::with_fps(30.0))
//!     .aoi(640, 480)
//!     .build();
//! ```

pub mod common;
mod mock_gateway;
mod pattern;

pub use common::{ChaosConfig, ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_gateway::{
    status_codes, DriverCall, JournalEntry, MockGateway, MockGatewayBuilder, MockGatewayConfig,
    ScriptedWait, DEFAULT_MAX_ALLOCATION_BYTES,
};

pub use pattern::{fill_test_pattern, read_frame_stamp};
