//! # seqcam
//!
//! Application layer over the sequence-buffer capture core.
//!
//! - **`config`**: layered TOML and environment configuration, validated and
//!   converted into [`seqcam_driver::CaptureSettings`].
//! - **`logging`**: `tracing-subscriber` setup driven by the `[logging]` section.
//! - **`run`**: a complete capture session against the simulated camera, as
//!   used by the `seqcam` binary.
//!
//! The capture core itself lives in the workspace crates:
//! `seqcam-core` (types, errors, the driver gateway trait), `seqcam-driver`
//! (buffer ring, event loop, frame delivery, lifecycle) and
//! `seqcam-driver-mock` (scripted gateway for tests and demos).

pub mod config;
pub mod logging;
pub mod run;
