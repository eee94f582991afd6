//! The native driver call surface.
//!
//! [`DriverGateway`] mirrors the vendor SDK one call per method. Calls are
//! synchronous and may block (most notably [`DriverGateway::wait_event`]), so
//! async callers run them on the blocking pool. Implementations must be
//! thread-safe: the event loop waits on one thread while the lifecycle
//! controller issues calls from another.

use crate::core::{
    AcquisitionMode, ActiveBuffer, BufferAllocation, BufferId, DeviceHandle, EventId, ImageSize,
    MemoryHandle, SensorInfo, SequenceNumber, WaitOutcome,
};
use crate::error::DriverError;
use crate::status::CaptureStatus;

/// Result of a single gateway call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

pub trait DriverGateway: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str {
        "driver"
    }

    // --- device ---------------------------------------------------------

    fn open(&self) -> DriverResult<DeviceHandle>;

    fn close(&self, device: DeviceHandle) -> DriverResult<()>;

    // --- geometry collaborators ----------------------------------------

    fn sensor_info(&self, device: DeviceHandle) -> DriverResult<SensorInfo>;

    /// Whether the sensor accepts arbitrary area-of-interest sizes.
    fn arbitrary_aoi_supported(&self, device: DeviceHandle) -> DriverResult<bool>;

    /// Size of the currently configured area of interest.
    fn aoi_image_size(&self, device: DeviceHandle) -> DriverResult<ImageSize>;

    // --- image memory ---------------------------------------------------

    fn allocate_buffer(
        &self,
        device: DeviceHandle,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> DriverResult<BufferAllocation>;

    fn free_buffer(&self, device: DeviceHandle, memory: MemoryHandle, id: BufferId)
        -> DriverResult<()>;

    // --- capture sequence -----------------------------------------------

    fn register_in_sequence(
        &self,
        device: DeviceHandle,
        memory: MemoryHandle,
        id: BufferId,
    ) -> DriverResult<()>;

    fn clear_sequence(&self, device: DeviceHandle) -> DriverResult<()>;

    fn lock_buffer(
        &self,
        device: DeviceHandle,
        seq: SequenceNumber,
        memory: MemoryHandle,
    ) -> DriverResult<()>;

    fn unlock_buffer(
        &self,
        device: DeviceHandle,
        seq: SequenceNumber,
        memory: MemoryHandle,
    ) -> DriverResult<()>;

    /// Currently filling buffer plus the most recently completed one.
    fn active_buffer(&self, device: DeviceHandle) -> DriverResult<ActiveBuffer>;

    // --- events ---------------------------------------------------------

    fn enable_event(&self, device: DeviceHandle, event: EventId) -> DriverResult<()>;

    fn disable_event(&self, device: DeviceHandle, event: EventId) -> DriverResult<()>;

    /// Block until `event` fires or `timeout_ms` elapses.
    fn wait_event(
        &self,
        device: DeviceHandle,
        event: EventId,
        timeout_ms: u32,
    ) -> DriverResult<WaitOutcome>;

    // --- acquisition ----------------------------------------------------

    fn start_acquisition(&self, device: DeviceHandle, mode: AcquisitionMode) -> DriverResult<()>;

    fn stop_acquisition(&self, device: DeviceHandle) -> DriverResult<()>;

    /// Driver-side capture fault counters.
    fn capture_status(&self, device: DeviceHandle) -> DriverResult<CaptureStatus>;
}
