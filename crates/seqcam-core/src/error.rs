//! Error types for the capture core.
//!
//! Two layers, both built with `thiserror`:
//!
//! - [`DriverError`] is what a [`DriverGateway`](crate::gateway::DriverGateway)
//!   call returns. Its [`DriverErrorKind`] separates a failed call
//!   (`Transport`, the driver could not be reached) from a well-formed request
//!   the driver refused (`Semantic`, carrying the driver's status code).
//! - [`CaptureError`] is what the capture core returns. It wraps driver errors
//!   and adds the failures only the core can detect: handle resolution
//!   failures, ring state violations, and startup aborts naming the step that
//!   failed.
//!
//! Event wait timeouts are not errors at all; they are reported as
//! [`WaitOutcome::TimedOut`](crate::core::WaitOutcome).

use crate::core::{EventId, MemoryHandle};
use std::fmt;
use thiserror::Error;

/// Status code a driver returns for a call on a closed or unknown device.
pub const INVALID_DEVICE_STATUS: i32 = 1;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The call itself failed (communication loss, binding failure).
    Transport,
    /// The driver answered with a non-success status code.
    Semantic,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverErrorKind::Transport => "transport",
            DriverErrorKind::Semantic => "semantic",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call}: {kind} error{}: {message}", .code.map(|c| format!(" (status {c})")).unwrap_or_default())]
pub struct DriverError {
    /// Name of the driver call that failed (e.g. `lock_buffer`).
    pub call: &'static str,
    pub kind: DriverErrorKind,
    /// Driver status code for semantic rejections.
    pub code: Option<i32>,
    pub message: String,
}

impl DriverError {
    pub fn transport(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            kind: DriverErrorKind::Transport,
            code: None,
            message: message.into(),
        }
    }

    pub fn semantic(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            kind: DriverErrorKind::Semantic,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind == DriverErrorKind::Transport
    }

    pub fn is_semantic(&self) -> bool {
        self.kind == DriverErrorKind::Semantic
    }

    /// The device handle the call was made with is no longer valid.
    pub fn is_invalid_device(&self) -> bool {
        self.is_semantic() && self.code == Some(INVALID_DEVICE_STATUS)
    }
}

// =============================================================================
// Capture Errors
// =============================================================================

/// Startup phases of a capture session, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    OpenDevice,
    ComputeGeometry,
    AllocateBuffers,
    RegisterSequence,
    EnableEvents,
    StartAcquisition,
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StartupStep::OpenDevice => "open device",
            StartupStep::ComputeGeometry => "compute frame geometry",
            StartupStep::AllocateBuffers => "allocate buffers",
            StartupStep::RegisterSequence => "register capture sequence",
            StartupStep::EnableEvents => "enable events",
            StartupStep::StartAcquisition => "start acquisition",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results of capture core operations.
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Primary error type of the capture core.
///
/// # Error Categories
///
/// 1. **Driver errors** - `Driver`, `Allocation`
///    - Transport or semantic failures reported by the gateway
///    - Recovery: depends on [`DriverErrorKind`]; transport errors may be transient
///
/// 2. **Consistency errors** - `Resolution`
///    - The driver returned a handle the ring never allocated
///    - Recovery: none for the session; during delivery the frame is skipped
///
/// 3. **Protocol violations** - `AlreadyRegistered`, `BufferLocked`, `BufferRegistered`, ...
///    - Rejected by the core before reaching the driver
///    - Recovery: fix the call order
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    /// A gateway call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The driver refused to allocate image memory.
    #[error("buffer allocation of {bytes} bytes failed: {source}")]
    Allocation {
        bytes: usize,
        #[source]
        source: DriverError,
    },

    /// Requested geometry does not fit in addressable memory.
    #[error("frame geometry {width}x{height}x{bits_per_pixel} overflows")]
    SizeOverflow {
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    },

    /// A memory handle from the driver maps to no managed buffer.
    #[error("memory handle {0} does not belong to the buffer ring")]
    Resolution(MemoryHandle),

    /// Buffer index outside the ring.
    #[error("buffer index {0} is not part of the ring")]
    UnknownBuffer(usize),

    /// Buffer was already released back to the driver.
    #[error("buffer {0} has been freed")]
    BufferFreed(usize),

    /// Buffer is already part of the capture sequence.
    #[error("buffer {0} is already registered in the capture sequence")]
    AlreadyRegistered(usize),

    /// Buffer must leave the capture sequence before this operation.
    #[error("buffer {0} is still registered in the capture sequence")]
    BufferRegistered(usize),

    /// Buffer is locked for read by a consumer.
    #[error("buffer {0} is locked for read")]
    BufferLocked(usize),

    /// Buffer is not locked, so it cannot be unlocked.
    #[error("buffer {0} is not locked")]
    NotLocked(usize),

    /// Buffer is not registered, so it cannot be locked.
    #[error("buffer {0} is not registered in the capture sequence")]
    NotRegistered(usize),

    /// A wait or subscription was requested for an event that is already active.
    #[error("event {0} is already subscribed")]
    AlreadySubscribed(EventId),

    /// No device is open.
    #[error("device is not open")]
    NotOpen,

    /// Operation not valid in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Startup aborted at `step`; everything before it was torn down.
    #[error("startup failed at step '{step}': {source}")]
    Startup {
        step: StartupStep,
        #[source]
        source: Box<CaptureError>,
    },
}

impl CaptureError {
    pub fn startup(step: StartupStep, source: CaptureError) -> Self {
        CaptureError::Startup {
            step,
            source: Box::new(source),
        }
    }

    /// True for failures of the driver call itself.
    pub fn is_transport(&self) -> bool {
        match self {
            CaptureError::Driver(e) | CaptureError::Allocation { source: e, .. } => e.is_transport(),
            CaptureError::Startup { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// True for well-formed requests that were refused, by the driver or by the core.
    pub fn is_semantic(&self) -> bool {
        match self {
            CaptureError::Driver(e) | CaptureError::Allocation { source: e, .. } => e.is_semantic(),
            CaptureError::Startup { source, .. } => source.is_semantic(),
            CaptureError::AlreadyRegistered(_)
            | CaptureError::BufferRegistered(_)
            | CaptureError::BufferLocked(_)
            | CaptureError::NotLocked(_)
            | CaptureError::NotRegistered(_)
            | CaptureError::BufferFreed(_)
            | CaptureError::UnknownBuffer(_)
            | CaptureError::AlreadySubscribed(_) => true,
            _ => false,
        }
    }

    /// True when driver and core disagree about which buffers exist.
    pub fn is_resolution(&self) -> bool {
        match self {
            CaptureError::Resolution(_) => true,
            CaptureError::Startup { source, .. } => source.is_resolution(),
            _ => false,
        }
    }

    /// Step at which startup failed, if this is a startup error.
    pub fn startup_step(&self) -> Option<StartupStep> {
        match self {
            CaptureError::Startup { step, .. } => Some(*step),
            _ => None,
        }
    }
}
