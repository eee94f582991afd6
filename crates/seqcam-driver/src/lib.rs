//! Sequence-buffer camera capture (componentized)
//!
//! - Connection: device handle ownership and frame geometry
//! - Buffer ring: allocation, capture sequence registration, handle resolution
//! - Event loop: perpetual waits on driver events
//! - Delivery: per-frame lock, hand-off and unlock
//!
//! [`SequenceCamera`] ties them together and owns the session lifecycle.

pub mod components;

use seqcam_core::{
    AcquisitionMode, CaptureError, CaptureResult, CaptureStatus, DeviceHandle, DriverGateway,
    EventId, ImageSize, MemoryHandle, StartupStep,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use crate::components::buffer_ring::{BufferRing, BufferState, FrameBuffer, SharedRing};
pub use crate::components::connection::DeviceConnection;
pub use crate::components::delivery::{
    ChannelConsumer, DeliveryOutcome, DeliveryStats, FnConsumer, FrameConsumer, FrameDelivery,
    LockedFrame,
};
pub use crate::components::event_loop::{
    callback, EventCallback, EventLoop, EventState, EventStatsSnapshot, DEFAULT_WAIT_TIMEOUT_MS,
};

/// Largest supported number of sequence buffers.
pub const MAX_BUFFER_COUNT: usize = 64;

/// Pixel depths the driver accepts for image memory.
pub const SUPPORTED_BITS_PER_PIXEL: [u32; 6] = [8, 10, 12, 16, 24, 32];

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Buffers in the capture sequence.
    pub buffer_count: usize,
    pub bits_per_pixel: u32,
    pub mode: AcquisitionMode,
    /// Per-wait timeout for the frame event.
    pub frame_timeout_ms: u32,
    /// Pause between a completed wait and the next one.
    pub rearm_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            bits_per_pixel: 8,
            mode: AcquisitionMode::Continuous,
            frame_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            rearm_delay: Duration::ZERO,
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(CaptureError::InvalidState(format!(
                "buffer_count must be in 1..={}, got {}",
                MAX_BUFFER_COUNT, self.buffer_count
            )));
        }
        if !SUPPORTED_BITS_PER_PIXEL.contains(&self.bits_per_pixel) {
            return Err(CaptureError::InvalidState(format!(
                "unsupported bits_per_pixel {}",
                self.bits_per_pixel
            )));
        }
        if self.frame_timeout_ms == 0 {
            return Err(CaptureError::InvalidState(
                "frame_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Teardown report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    DisableEvents,
    StopAcquisition,
    ClearSequence,
    FreeBuffers,
    CloseDevice,
}

impl TeardownStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownStep::DisableEvents => "disable events",
            TeardownStep::StopAcquisition => "stop acquisition",
            TeardownStep::ClearSequence => "clear sequence",
            TeardownStep::FreeBuffers => "free buffers",
            TeardownStep::CloseDevice => "close device",
        }
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed,
    /// Nothing to do (e.g. no buffer was ever registered).
    Skipped,
    /// Attempted; every error the step ran into.
    Failed(Vec<CaptureError>),
}

impl StepOutcome {
    fn from_errors(errors: Vec<CaptureError>) -> Self {
        if errors.is_empty() {
            StepOutcome::Completed
        } else {
            StepOutcome::Failed(errors)
        }
    }

    fn from_result(result: CaptureResult<()>) -> Self {
        match result {
            Ok(()) => StepOutcome::Completed,
            Err(e) => StepOutcome::Failed(vec![e]),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn errors(&self) -> &[CaptureError] {
        match self {
            StepOutcome::Failed(errors) => errors,
            _ => &[],
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Completed => f.write_str("completed"),
            StepOutcome::Skipped => f.write_str("skipped"),
            StepOutcome::Failed(errors) => write!(f, "failed ({} error(s))", errors.len()),
        }
    }
}

/// One outcome per teardown step, in execution order.
#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub disable_events: StepOutcome,
    pub stop_acquisition: StepOutcome,
    pub clear_sequence: StepOutcome,
    pub free_buffers: StepOutcome,
    pub close_device: StepOutcome,
}

impl TeardownReport {
    fn all_skipped() -> Self {
        Self {
            disable_events: StepOutcome::Skipped,
            stop_acquisition: StepOutcome::Skipped,
            clear_sequence: StepOutcome::Skipped,
            free_buffers: StepOutcome::Skipped,
            close_device: StepOutcome::Skipped,
        }
    }

    pub fn steps(&self) -> [(TeardownStep, &StepOutcome); 5] {
        [
            (TeardownStep::DisableEvents, &self.disable_events),
            (TeardownStep::StopAcquisition, &self.stop_acquisition),
            (TeardownStep::ClearSequence, &self.clear_sequence),
            (TeardownStep::FreeBuffers, &self.free_buffers),
            (TeardownStep::CloseDevice, &self.close_device),
        ]
    }

    /// True when no step failed.
    pub fn is_clean(&self) -> bool {
        self.steps().iter().all(|(_, outcome)| !outcome.is_failed())
    }

    pub fn failures(&self) -> Vec<(TeardownStep, &CaptureError)> {
        self.steps()
            .into_iter()
            .flat_map(|(step, outcome)| outcome.errors().iter().map(move |e| (step, e)))
            .collect()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (step, outcome)) in self.steps().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", step, outcome)?;
        }
        Ok(())
    }
}

// =============================================================================
// SequenceCamera
// =============================================================================

/// A capture session over one device.
///
/// # Lifecycle
///
/// [`start`](Self::start) opens the device, sizes and allocates the buffers,
/// registers them in the capture sequence, arms the frame event and starts
/// acquisition. Any failure tears down whatever was set up and is reported as
/// [`CaptureError::Startup`] naming the step.
///
/// [`teardown`](Self::teardown) undoes everything in reverse dependency order,
/// attempting every step even when earlier ones fail. Call it before dropping;
/// `Drop` cannot run async teardown and only logs.
pub struct SequenceCamera {
    connection: DeviceConnection,
    settings: CaptureSettings,
    ring: SharedRing,
    events: Option<EventLoop>,
    /// Event counters frozen at the last teardown.
    last_event_stats: HashMap<EventId, EventStatsSnapshot>,
    delivery: Option<Arc<FrameDelivery>>,
    geometry: Option<ImageSize>,
    acquiring: bool,
}

impl SequenceCamera {
    pub fn new(gateway: Arc<dyn DriverGateway>, settings: CaptureSettings) -> Self {
        Self {
            ring: BufferRing::shared(gateway.clone()),
            connection: DeviceConnection::new(gateway),
            settings,
            events: None,
            last_event_stats: HashMap::new(),
            delivery: None,
            geometry: None,
            acquiring: false,
        }
    }

    /// Run startup, delivering frames to `consumer`.
    pub async fn start(&mut self, consumer: Arc<dyn FrameConsumer>) -> CaptureResult<()> {
        if self.connection.is_open() {
            return Err(CaptureError::InvalidState(
                "session already started".to_string(),
            ));
        }
        self.settings.validate()?;
        self.last_event_stats.clear();

        match self.run_startup(consumer) {
            Ok(device) => {
                tracing::info!(
                    device = %device,
                    buffers = self.settings.buffer_count,
                    mode = self.settings.mode.as_str(),
                    "acquisition started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "startup failed; tearing down");
                let report = self.teardown().await;
                if !report.is_clean() {
                    tracing::warn!(%report, "teardown after failed startup was incomplete");
                }
                Err(e)
            }
        }
    }

    fn run_startup(&mut self, consumer: Arc<dyn FrameConsumer>) -> CaptureResult<DeviceHandle> {
        let settings = self.settings.clone();

        let device = self
            .connection
            .open()
            .map_err(|e| CaptureError::startup(StartupStep::OpenDevice, e))?;

        let size = self
            .connection
            .frame_geometry()
            .map_err(|e| CaptureError::startup(StartupStep::ComputeGeometry, e))?;
        self.geometry = Some(size);
        tracing::debug!(%size, bits_per_pixel = settings.bits_per_pixel, "frame geometry");

        {
            let mut ring = self.ring.lock();
            for _ in 0..settings.buffer_count {
                ring.allocate(device, size.width, size.height, settings.bits_per_pixel)
                    .map_err(|e| CaptureError::startup(StartupStep::AllocateBuffers, e))?;
            }
            for index in ring.live_indices() {
                ring.register(device, index)
                    .map_err(|e| CaptureError::startup(StartupStep::RegisterSequence, e))?;
            }
        }

        let gateway = self.connection.gateway().clone();
        let delivery = Arc::new(FrameDelivery::new(
            gateway.clone(),
            device,
            self.ring.clone(),
            consumer,
        ));
        let on_frame = {
            let delivery = delivery.clone();
            callback(move || {
                let delivery = delivery.clone();
                async move { delivery.deliver_next().await.map(|_| ()) }
            })
        };
        self.delivery = Some(delivery);

        let events = EventLoop::new(gateway.clone(), device).with_rearm_delay(settings.rearm_delay);
        let subscribed = events.subscribe(EventId::FRAME, settings.frame_timeout_ms, on_frame);
        self.events = Some(events);
        subscribed.map_err(|e| CaptureError::startup(StartupStep::EnableEvents, e))?;

        gateway
            .start_acquisition(device, settings.mode)
            .map_err(|e| CaptureError::startup(StartupStep::StartAcquisition, e.into()))?;
        self.acquiring = true;
        Ok(device)
    }

    /// Release every driver resource. Idempotent.
    ///
    /// Waits for an in-flight frame to be released by the consumer before
    /// disabling its event.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::all_skipped();

        if let Some(events) = self.events.take() {
            let results = events.unsubscribe_all().await;
            self.last_event_stats = events.all_stats();
            if !results.is_empty() {
                report.disable_events = StepOutcome::from_errors(
                    results.into_iter().filter_map(|(_, r)| r.err()).collect(),
                );
            }
        }

        let gateway = self.connection.gateway().clone();
        let device = self.connection.handle();

        if let Some(device) = device {
            report.stop_acquisition =
                StepOutcome::from_result(gateway.stop_acquisition(device).map_err(Into::into));
            self.acquiring = false;

            let mut ring = self.ring.lock();
            if ring.ever_registered() {
                report.clear_sequence = StepOutcome::from_result(ring.clear_sequence(device));
            }

            let live = ring.live_indices();
            if !live.is_empty() {
                let errors = live
                    .into_iter()
                    .filter_map(|index| ring.free(device, index).err())
                    .collect();
                report.free_buffers = StepOutcome::from_errors(errors);
            }
        }

        report.close_device = match self.connection.close() {
            Ok(true) => StepOutcome::Completed,
            Ok(false) => StepOutcome::Skipped,
            Err(e) => StepOutcome::Failed(vec![e]),
        };
        if device.is_some() {
            self.ring.lock().reset();
        }
        self.geometry = None;

        for (step, error) in report.failures() {
            tracing::warn!(%step, %error, "teardown step failed");
        }
        if device.is_some() {
            tracing::info!(%report, "teardown finished");
        }
        report
    }

    /// Arm an additional event on the running session.
    pub fn subscribe(
        &self,
        event: EventId,
        timeout_ms: u32,
        on_fire: EventCallback,
    ) -> CaptureResult<()> {
        self.events
            .as_ref()
            .ok_or(CaptureError::NotOpen)?
            .subscribe(event, timeout_ms, on_fire)
    }

    pub async fn unsubscribe(&self, event: EventId) -> CaptureResult<()> {
        match &self.events {
            Some(events) => events.unsubscribe(event).await,
            None => Ok(()),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.connection.handle()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Buffer size chosen at startup.
    pub fn geometry(&self) -> Option<ImageSize> {
        self.geometry
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn resolve(&self, memory: MemoryHandle) -> CaptureResult<usize> {
        self.ring.lock().resolve(memory)
    }

    /// Delivery counters of the current or most recent session.
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.delivery
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default()
    }

    /// Event counters of the current or most recent session.
    pub fn event_stats(&self, event: EventId) -> Option<EventStatsSnapshot> {
        match &self.events {
            Some(events) => events.stats(event),
            None => self.last_event_stats.get(&event).copied(),
        }
    }

    pub fn event_state(&self, event: EventId) -> EventState {
        self.events
            .as_ref()
            .map(|e| e.state(event))
            .unwrap_or(EventState::Disabled)
    }

    pub fn capture_status(&self) -> CaptureResult<CaptureStatus> {
        self.connection.capture_status()
    }
}

impl fmt::Debug for SequenceCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceCamera")
            .field("connection", &self.connection)
            .field("settings", &self.settings)
            .field("geometry", &self.geometry)
            .field("acquiring", &self.acquiring)
            .finish()
    }
}

/// Drop cannot await teardown; it only reports the leak.
impl Drop for SequenceCamera {
    fn drop(&mut self) {
        if self.connection.is_open() {
            tracing::warn!(
                device = ?self.connection.handle(),
                "SequenceCamera dropped while open. Call teardown().await before dropping; \
                 driver resources are left allocated."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validation() {
        assert!(CaptureSettings::default().validate().is_ok());

        let bad = CaptureSettings {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = CaptureSettings {
            bits_per_pixel: 9,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = CaptureSettings {
            frame_timeout_ms: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_report_display_and_failures() {
        let mut report = TeardownReport::all_skipped();
        report.disable_events = StepOutcome::Completed;
        report.stop_acquisition = StepOutcome::Failed(vec![CaptureError::NotOpen]);
        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].0, TeardownStep::StopAcquisition);
        assert_eq!(
            report.to_string(),
            "disable events: completed, stop acquisition: failed (1 error(s)), \
             clear sequence: skipped, free buffers: skipped, close device: skipped"
        );
    }
}
