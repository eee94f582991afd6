//! Decoding of the driver's capture status counters.
//!
//! The driver keeps one counter per fault code (256 slots) plus a total. Only
//! non-zero counters are interesting, and only a handful of codes have names.

use std::fmt;

/// Number of per-code counters reported by the driver.
pub const CAPTURE_STATUS_SLOTS: usize = 256;

/// Known capture fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaptureFault {
    ApiNoDestinationMemory,
    ApiConversionFailed,
    ApiImageLocked,
    DriverOutOfBuffers,
    DriverDeviceNotReady,
    UsbTransferFailed,
    DeviceTimeout,
    DeviceFrameCaptureFailed,
    EthernetBufferOverrun,
    DeviceMissedImages,
    Other(u8),
}

impl CaptureFault {
    pub fn from_code(code: u8) -> Self {
        match code {
            0xa2 => CaptureFault::ApiNoDestinationMemory,
            0xa3 => CaptureFault::ApiConversionFailed,
            0xa5 => CaptureFault::ApiImageLocked,
            0xb2 => CaptureFault::DriverOutOfBuffers,
            0xb4 => CaptureFault::DriverDeviceNotReady,
            0xc7 => CaptureFault::UsbTransferFailed,
            0xd6 => CaptureFault::DeviceTimeout,
            0xd9 => CaptureFault::DeviceFrameCaptureFailed,
            0xe4 => CaptureFault::EthernetBufferOverrun,
            0xe5 => CaptureFault::DeviceMissedImages,
            other => CaptureFault::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            CaptureFault::ApiNoDestinationMemory => 0xa2,
            CaptureFault::ApiConversionFailed => 0xa3,
            CaptureFault::ApiImageLocked => 0xa5,
            CaptureFault::DriverOutOfBuffers => 0xb2,
            CaptureFault::DriverDeviceNotReady => 0xb4,
            CaptureFault::UsbTransferFailed => 0xc7,
            CaptureFault::DeviceTimeout => 0xd6,
            CaptureFault::DeviceFrameCaptureFailed => 0xd9,
            CaptureFault::EthernetBufferOverrun => 0xe4,
            CaptureFault::DeviceMissedImages => 0xe5,
            CaptureFault::Other(code) => *code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureFault::ApiNoDestinationMemory => "api_no_dest_mem",
            CaptureFault::ApiConversionFailed => "api_conversion_failed",
            CaptureFault::ApiImageLocked => "api_image_locked",
            CaptureFault::DriverOutOfBuffers => "drv_out_of_buffers",
            CaptureFault::DriverDeviceNotReady => "drv_device_not_ready",
            CaptureFault::UsbTransferFailed => "usb_transfer_failed",
            CaptureFault::DeviceTimeout => "dev_timeout",
            CaptureFault::DeviceFrameCaptureFailed => "dev_frame_capture_failed",
            CaptureFault::EthernetBufferOverrun => "eth_buffer_overrun",
            CaptureFault::DeviceMissedImages => "dev_missed_images",
            CaptureFault::Other(_) => "other",
        }
    }
}

impl fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureFault::Other(code) => write!(f, "other({:#04x})", code),
            named => write!(f, "{}", named.as_str()),
        }
    }
}

/// Raw capture status as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    pub total: u32,
    /// One counter per fault code, indexed by code.
    pub counters: Vec<u32>,
}

impl CaptureStatus {
    pub fn empty() -> Self {
        Self {
            total: 0,
            counters: vec![0; CAPTURE_STATUS_SLOTS],
        }
    }

    /// Non-zero counters, in code order.
    pub fn faults(&self) -> Vec<(CaptureFault, u32)> {
        self.counters
            .iter()
            .enumerate()
            .take(CAPTURE_STATUS_SLOTS)
            .filter(|(_, count)| **count > 0)
            .map(|(code, count)| (CaptureFault::from_code(code as u8), *count))
            .collect()
    }

    pub fn count(&self, fault: CaptureFault) -> u32 {
        self.counters
            .get(fault.code() as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_clean(&self) -> bool {
        self.total == 0
    }
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::empty()
    }
}
