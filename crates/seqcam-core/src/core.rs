//! Handle and value types shared between the driver gateway and the capture core.
//!
//! Every identifier the vendor driver hands out is wrapped in a newtype so the
//! capture core can never confuse a memory handle with a buffer id or a
//! sequence slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;

/// Opaque camera handle returned by the driver on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hcam#{}", self.0)
    }
}

/// Opaque driver memory handle (the address of the driver-owned image memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub usize);

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Driver-assigned buffer id, returned together with the memory handle on allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// 1-based slot in the driver's capture sequence.
///
/// Lock and unlock calls address buffers by this number rather than by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceNumber(pub u32);

/// Hardware or driver event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u32);

impl EventId {
    /// A frame finished transferring into a sequence buffer.
    pub const FRAME: EventId = EventId(2);
    /// External trigger input fired.
    pub const EXTERNAL_TRIGGER: EventId = EventId(3);
    /// The last buffer of the capture sequence was filled.
    pub const SEQUENCE: EventId = EventId(5);

    /// Human readable name for well-known events.
    pub fn name(self) -> &'static str {
        match self {
            EventId::FRAME => "frame",
            EventId::EXTERNAL_TRIGGER => "external_trigger",
            EventId::SEQUENCE => "sequence",
            _ => "custom",
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes needed for one frame at `bits_per_pixel`, or `None` on overflow.
    pub fn frame_bytes(&self, bits_per_pixel: u32) -> Option<usize> {
        let bits = (self.width as u64)
            .checked_mul(self.height as u64)?
            .checked_mul(bits_per_pixel as u64)?;
        usize::try_from(bits / 8).ok()
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Subset of the sensor description needed to size buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    pub sensor_id: u16,
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    pub global_shutter: bool,
}

impl SensorInfo {
    pub fn max_size(&self) -> ImageSize {
        ImageSize::new(self.max_width, self.max_height)
    }
}

/// How acquisition is started once buffers and events are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Live video into the capture sequence until stopped.
    #[default]
    Continuous,
    /// Capture one frame (freeze video).
    SingleShot,
}

impl AcquisitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionMode::Continuous => "continuous",
            AcquisitionMode::SingleShot => "single_shot",
        }
    }
}

/// Result of a single event wait. A timeout is the normal idle condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Fired,
    TimedOut,
}

/// Answer to the active-buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveBuffer {
    /// Id of the buffer the driver is currently filling.
    pub id: BufferId,
    /// Memory the driver is currently filling.
    pub memory: MemoryHandle,
    /// Memory of the most recently completed image.
    pub previous: MemoryHandle,
}

/// Driver-owned pixel memory of one frame buffer.
///
/// The region stays valid from the allocate call until the matching free call.
/// Reading it is only sound while the buffer is locked, because the driver may
/// otherwise be writing into it.
#[derive(Debug, Clone, Copy)]
pub struct PixelRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a plain address range owned by the driver; access is
// synchronized by the lock/unlock protocol, not by the pointer itself.
#[allow(unsafe_code)]
unsafe impl Send for PixelRegion {}
#[allow(unsafe_code)]
unsafe impl Sync for PixelRegion {}

#[allow(unsafe_code)]
impl PixelRegion {
    /// Wrap driver memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay allocated until the buffer is
    /// freed through the same driver.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Borrow the pixel bytes.
    ///
    /// # Safety
    ///
    /// The buffer must be locked for read (the driver does not write into it)
    /// and must not be freed while the returned slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

/// Everything the driver returns for a successful allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub memory: MemoryHandle,
    pub id: BufferId,
    pub region: PixelRegion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_for_common_depths() {
        let size = ImageSize::new(640, 480);
        assert_eq!(size.frame_bytes(8), Some(307_200));
        assert_eq!(size.frame_bytes(16), Some(614_400));
        assert_eq!(size.frame_bytes(12), Some(460_800));
    }

    #[test]
    fn frame_bytes_overflow_is_none() {
        let size = ImageSize::new(u32::MAX, u32::MAX);
        if usize::BITS == 64 {
            assert!(size.frame_bytes(32).is_none());
        }
    }

    #[test]
    fn event_names() {
        assert_eq!(EventId::FRAME.to_string(), "frame(2)");
        assert_eq!(EventId(77).name(), "custom");
    }

    #[test]
    fn acquisition_mode_serde() {
        let mode: AcquisitionMode = serde_json::from_str("\"single_shot\"").unwrap();
        assert_eq!(mode, AcquisitionMode::SingleShot);
        assert_eq!(AcquisitionMode::default().as_str(), "continuous");
    }
}
