//! `seqcam-core`
//!
//! Shared building blocks for the sequence-buffer capture core:
//!
//! - [`core`]: opaque driver handles and small value types
//! - [`error`]: [`DriverError`] (what a driver call returns) and
//!   [`CaptureError`] (what the capture core returns)
//! - [`gateway`]: the [`DriverGateway`] trait, one method per native driver call
//! - [`status`]: decoding of the driver's capture fault counters
//!
//! Driver implementations depend only on this crate, so a real SDK binding and
//! the mock gateway are interchangeable behind `Arc<dyn DriverGateway>`.

pub mod core;
pub mod error;
pub mod gateway;
pub mod status;

pub use crate::core::{
    AcquisitionMode, ActiveBuffer, BufferAllocation, BufferId, DeviceHandle, EventId, ImageSize,
    MemoryHandle, PixelRegion, SensorInfo, SequenceNumber, WaitOutcome,
};
pub use crate::error::{
    CaptureError, CaptureResult, DriverError, DriverErrorKind, StartupStep, INVALID_DEVICE_STATUS,
};
pub use crate::gateway::{DriverGateway, DriverResult};
pub use crate::status::{CaptureFault, CaptureStatus};
