//! Mock driver gateway with a scripted event source and a call journal.
//!
//! [`MockGateway`] behaves like a sequence-capture driver: it owns real image
//! memory, keeps a capture sequence, honours buffer locks, and raises the frame
//! event either on demand ([`MockGateway::trigger`], scripted waits) or, in
//! free-running modes, at the configured frame rate.
//!
//! Every call is recorded in a journal so tests can assert call order, and
//! every ordering mistake the real driver would punish with undefined
//! behaviour (freeing a registered buffer, closing with memory allocated,
//! clearing a running sequence) is recorded as a violation.

use crate::common::{ChaosConfig, ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::pattern::fill_test_pattern;
use parking_lot::{Condvar, Mutex};
use seqcam_core::{
    AcquisitionMode, ActiveBuffer, BufferAllocation, BufferId, CaptureFault, CaptureStatus,
    DeviceHandle, DriverError, DriverErrorKind, DriverGateway, DriverResult, EventId, ImageSize,
    MemoryHandle, PixelRegion, SensorInfo, SequenceNumber, WaitOutcome,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Status codes returned for semantic rejections.
pub mod status_codes {
    pub const NO_SUCCESS: i32 = -1;
    pub const INVALID_CAMERA_HANDLE: i32 = seqcam_core::INVALID_DEVICE_STATUS;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const NO_ACTIVE_IMG_MEM: i32 = 12;
    pub const INVALID_MEMORY_POINTER: i32 = 49;
    pub const INVALID_PARAMETER: i32 = 125;
    pub const CAPTURE_RUNNING: i32 = 140;
    pub const SEQUENCE_BUF_ALREADY_LOCKED: i32 = 179;
    pub const EVENT_NOT_ENABLED: i32 = 180;
}

use status_codes::*;

/// Default upper bound for a single allocation (256 MiB).
pub const DEFAULT_MAX_ALLOCATION_BYTES: usize = 256 * 1024 * 1024;

// =============================================================================
// Journal
// =============================================================================

/// One driver call as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Open(DeviceHandle),
    Close,
    SensorInfo,
    ArbitraryAoiSupported,
    AoiImageSize,
    AllocateBuffer {
        memory: MemoryHandle,
        id: BufferId,
        bytes: usize,
    },
    FreeBuffer {
        memory: MemoryHandle,
        id: BufferId,
    },
    RegisterInSequence {
        memory: MemoryHandle,
        id: BufferId,
    },
    ClearSequence,
    LockBuffer {
        seq: SequenceNumber,
        memory: MemoryHandle,
    },
    UnlockBuffer {
        seq: SequenceNumber,
        memory: MemoryHandle,
    },
    ActiveBuffer,
    EnableEvent(EventId),
    DisableEvent(EventId),
    WaitEvent {
        event: EventId,
        outcome: Option<WaitOutcome>,
    },
    StartAcquisition(AcquisitionMode),
    StopAcquisition,
    CaptureStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub call: DriverCall,
    pub ok: bool,
}

/// Outcome to hand back from a future `wait_event` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedWait {
    Fire,
    Timeout,
    Error(DriverErrorKind),
}

// =============================================================================
// Image memory
// =============================================================================

/// Heap memory standing in for driver-owned image memory.
///
/// Only the raw pointer is kept so that slices handed out through
/// [`PixelRegion`] stay valid while the mock writes into other buffers.
struct MockBuffer {
    id: BufferId,
    ptr: NonNull<u8>,
    len: usize,
    size: ImageSize,
    bits_per_pixel: u32,
}

// SAFETY: the allocation is exclusively owned by the buffer and only touched
// under the gateway's state mutex.
#[allow(unsafe_code)]
unsafe impl Send for MockBuffer {}

#[allow(unsafe_code)]
impl MockBuffer {
    fn new(id: BufferId, len: usize, size: ImageSize, bits_per_pixel: u32) -> Self {
        let raw: *mut [u8] = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<u8>()) };
        Self {
            id,
            ptr,
            len,
            size,
            bits_per_pixel,
        }
    }

    fn memory(&self) -> MemoryHandle {
        MemoryHandle(self.ptr.as_ptr() as usize)
    }

    fn region(&self) -> PixelRegion {
        // SAFETY: the allocation lives until this buffer is dropped, which only
        // happens on free_buffer/close.
        unsafe { PixelRegion::from_raw_parts(self.ptr, self.len) }
    }

    fn fill(&mut self, frame_num: u64) {
        // SAFETY: ptr/len describe the live allocation; callers never fill a
        // locked buffer, so no reader observes this write.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        fill_test_pattern(
            bytes,
            self.size.width,
            self.size.height,
            self.bits_per_pixel,
            frame_num,
        );
    }
}

#[allow(unsafe_code)]
impl Drop for MockBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::into_raw in MockBuffer::new.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Static description of the simulated camera.
#[derive(Debug, Clone)]
pub struct MockGatewayConfig {
    pub sensor: SensorInfo,
    /// Whether the sensor reports arbitrary AOI support.
    pub arbitrary_aoi: bool,
    /// Currently configured AOI.
    pub aoi: ImageSize,
    pub max_allocation_bytes: usize,
}

impl Default for MockGatewayConfig {
    fn default() -> Self {
        Self {
            sensor: SensorInfo {
                sensor_id: 0x0230,
                name: "MOCK-UI1240".to_string(),
                max_width: 1280,
                max_height: 1024,
                global_shutter: true,
            },
            arbitrary_aoi: true,
            aoi: ImageSize::new(640, 480),
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION_BYTES,
        }
    }
}

/// Builder for [`MockGateway`].
#[derive(Debug, Default)]
pub struct MockGatewayBuilder {
    config: MockGatewayConfig,
    mode: MockMode,
    timing: TimingConfig,
    chaos: ChaosConfig,
    errors: ErrorConfig,
}

impl MockGatewayBuilder {
    pub fn sensor_size(mut self, width: u32, height: u32) -> Self {
        self.config.sensor.max_width = width;
        self.config.sensor.max_height = height;
        self
    }

    pub fn arbitrary_aoi(mut self, supported: bool) -> Self {
        self.config.arbitrary_aoi = supported;
        self
    }

    pub fn aoi(mut self, width: u32, height: u32) -> Self {
        self.config.aoi = ImageSize::new(width, height);
        self
    }

    pub fn max_allocation_bytes(mut self, bytes: usize) -> Self {
        self.config.max_allocation_bytes = bytes;
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timing_config(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Only used in [`MockMode::Chaos`].
    pub fn chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }

    pub fn error_config(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn build(self) -> MockGateway {
        MockGateway {
            config: self.config,
            mode: self.mode,
            timing: self.timing,
            rng: MockRng::new(self.chaos.seed),
            chaos: self.chaos,
            errors: self.errors,
            state: Mutex::new(MockState::default()),
            wake: Condvar::new(),
            journal: Mutex::new(Vec::new()),
        }
    }
}

// =============================================================================
// MockGateway
// =============================================================================

#[derive(Default)]
struct MockState {
    device: Option<DeviceHandle>,
    next_device: u32,
    next_buffer_id: u32,
    buffers: Vec<MockBuffer>,
    sequence: Vec<MemoryHandle>,
    locked: HashMap<MemoryHandle, SequenceNumber>,
    events: HashSet<EventId>,
    scripts: HashMap<EventId, VecDeque<ScriptedWait>>,
    pending: HashMap<EventId, u32>,
    acquisition: Option<AcquisitionMode>,
    next_frame_due: Option<Instant>,
    cursor: usize,
    last_completed: Option<MemoryHandle>,
    foreign_active: Option<MemoryHandle>,
    frames_captured: u64,
    status: CaptureStatus,
    violations: Vec<String>,
}

impl MockState {
    fn require_device(&self, call: &'static str, device: DeviceHandle) -> DriverResult<()> {
        if self.device == Some(device) {
            Ok(())
        } else {
            Err(DriverError::semantic(
                call,
                INVALID_CAMERA_HANDLE,
                format!("{} is not open", device),
            ))
        }
    }

    fn buffer_position(
        &self,
        call: &'static str,
        memory: MemoryHandle,
        id: BufferId,
    ) -> DriverResult<usize> {
        self.buffers
            .iter()
            .position(|b| b.memory() == memory && b.id == id)
            .ok_or_else(|| {
                DriverError::semantic(
                    call,
                    INVALID_MEMORY_POINTER,
                    format!("no image memory {} with id {}", memory, id.0),
                )
            })
    }

    fn sequence_slot(&self, memory: MemoryHandle) -> Option<SequenceNumber> {
        self.sequence
            .iter()
            .position(|m| *m == memory)
            .map(|pos| SequenceNumber(pos as u32 + 1))
    }

    fn record_fault(&mut self, fault: CaptureFault) {
        self.status.total += 1;
        if let Some(counter) = self.status.counters.get_mut(fault.code() as usize) {
            *counter += 1;
        }
    }

    /// Write the next frame into the first unlocked buffer after the cursor.
    fn capture_frame(&mut self) -> bool {
        let len = self.sequence.len();
        if len == 0 {
            self.record_fault(CaptureFault::ApiNoDestinationMemory);
            return false;
        }
        for step in 0..len {
            let slot = (self.cursor + step) % len;
            let memory = self.sequence[slot];
            if self.locked.contains_key(&memory) {
                continue;
            }
            let frame_num = self.frames_captured + 1;
            if let Some(buffer) = self.buffers.iter_mut().find(|b| b.memory() == memory) {
                buffer.fill(frame_num);
            }
            self.frames_captured = frame_num;
            self.last_completed = Some(memory);
            self.cursor = (slot + 1) % len;
            if self.acquisition == Some(AcquisitionMode::SingleShot) {
                self.acquisition = None;
            }
            tracing::trace!(slot, frame_num, "mock captured frame");
            return true;
        }
        self.record_fault(CaptureFault::DriverOutOfBuffers);
        false
    }

    fn fire(&mut self, event: EventId) {
        if event == EventId::FRAME && self.acquisition.is_some() {
            self.capture_frame();
        }
    }
}

/// Scripted stand-in for the native driver.
pub struct MockGateway {
    config: MockGatewayConfig,
    mode: MockMode,
    timing: TimingConfig,
    chaos: ChaosConfig,
    rng: MockRng,
    errors: ErrorConfig,
    state: Mutex<MockState>,
    wake: Condvar,
    journal: Mutex<Vec<JournalEntry>>,
}

impl MockGateway {
    /// Instant-mode gateway with the default sensor.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockGatewayBuilder {
        MockGatewayBuilder::default()
    }

    pub fn mode(&self) -> MockMode {
        self.mode
    }

    // --- scripting --------------------------------------------------------

    /// Queue outcomes for future waits on `event`, consumed in order.
    pub fn script_waits(&self, event: EventId, outcomes: impl IntoIterator<Item = ScriptedWait>) {
        let mut state = self.state.lock();
        state.scripts.entry(event).or_default().extend(outcomes);
        self.wake.notify_all();
    }

    /// Fire `event` once; a blocked or future wait returns [`WaitOutcome::Fired`].
    pub fn trigger(&self, event: EventId) {
        self.trigger_n(event, 1);
    }

    pub fn trigger_n(&self, event: EventId, count: u32) {
        let mut state = self.state.lock();
        *state.pending.entry(event).or_insert(0) += count;
        self.wake.notify_all();
    }

    /// Make the next active-buffer query report memory the ring never allocated.
    pub fn inject_foreign_active_buffer(&self, memory: MemoryHandle) {
        self.state.lock().foreign_active = Some(memory);
    }

    /// Bump a capture fault counter.
    pub fn record_capture_fault(&self, fault: CaptureFault, count: u32) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.record_fault(fault);
        }
    }

    // --- inspection -------------------------------------------------------

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    /// Successful calls, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.ok)
            .map(|e| e.call.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Ordering mistakes the real driver would not survive.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().device.is_some()
    }

    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquisition.is_some()
    }

    pub fn allocated_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn sequence_len(&self) -> usize {
        self.state.lock().sequence.len()
    }

    pub fn locked_buffers(&self) -> usize {
        self.state.lock().locked.len()
    }

    pub fn enabled_events(&self) -> Vec<EventId> {
        let mut events: Vec<_> = self.state.lock().events.iter().copied().collect();
        events.sort();
        events
    }

    pub fn frames_captured(&self) -> u64 {
        self.state.lock().frames_captured
    }

    // --- internals --------------------------------------------------------

    fn enter(&self, call: &'static str) -> DriverResult<()> {
        if self.timing.call_delay_ms > 0 {
            std::thread::sleep(self.timing.call_delay());
        }
        self.errors.check_operation(call)
    }

    fn next_interval(&self) -> Duration {
        let base = self.timing.frame_interval().max(Duration::from_millis(1));
        if self.mode == MockMode::Chaos {
            self.rng.jitter(base, self.chaos.jitter)
        } else {
            base
        }
    }

    fn readout_missed(&self) -> bool {
        self.mode == MockMode::Chaos && self.rng.chance(self.chaos.missed_frame_rate)
    }

    fn record<T>(&self, call: DriverCall, result: &DriverResult<T>) {
        self.journal.lock().push(JournalEntry {
            call,
            ok: result.is_ok(),
        });
    }

    fn wait_locked(
        &self,
        device: DeviceHandle,
        event: EventId,
        timeout_ms: u32,
    ) -> DriverResult<WaitOutcome> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut state = self.state.lock();

        loop {
            state.require_device("wait_event", device)?;
            if !state.events.contains(&event) {
                return Err(DriverError::semantic(
                    "wait_event",
                    EVENT_NOT_ENABLED,
                    format!("event {} is not enabled", event),
                ));
            }

            if let Some(scripted) = state.scripts.get_mut(&event).and_then(VecDeque::pop_front) {
                return match scripted {
                    ScriptedWait::Fire => {
                        state.fire(event);
                        Ok(WaitOutcome::Fired)
                    }
                    ScriptedWait::Timeout => Ok(WaitOutcome::TimedOut),
                    ScriptedWait::Error(DriverErrorKind::Transport) => Err(
                        DriverError::transport("wait_event", "scripted transport failure"),
                    ),
                    ScriptedWait::Error(DriverErrorKind::Semantic) => Err(DriverError::semantic(
                        "wait_event",
                        NO_SUCCESS,
                        "scripted wait failure",
                    )),
                };
            }

            if let Some(count) = state.pending.get_mut(&event).filter(|c| **c > 0) {
                *count -= 1;
                state.fire(event);
                return Ok(WaitOutcome::Fired);
            }

            let now = Instant::now();
            let mut wake_at = deadline;
            if self.mode.free_running()
                && event == EventId::FRAME
                && state.acquisition == Some(AcquisitionMode::Continuous)
            {
                let scheduled = state.next_frame_due;
                let due = match scheduled {
                    Some(due) => due,
                    None => {
                        let due = now + self.next_interval();
                        state.next_frame_due = Some(due);
                        due
                    }
                };
                if now >= due {
                    let next = now + self.next_interval();
                    state.next_frame_due = Some(next);
                    if self.readout_missed() {
                        tracing::trace!("mock readout missed");
                        state.record_fault(CaptureFault::DeviceMissedImages);
                    } else if state.capture_frame() {
                        return Ok(WaitOutcome::Fired);
                    }
                    wake_at = wake_at.min(next);
                } else {
                    wake_at = wake_at.min(due);
                }
            }

            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            self.wake.wait_until(&mut state, wake_at);
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGateway")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .finish()
    }
}

impl DriverGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&self) -> DriverResult<DeviceHandle> {
        let result = self.enter("open").and_then(|_| {
            let mut state = self.state.lock();
            if let Some(device) = state.device {
                return Err(DriverError::semantic(
                    "open",
                    NO_SUCCESS,
                    format!("camera already open as {}", device),
                ));
            }
            state.next_device += 1;
            let device = DeviceHandle(state.next_device);
            state.device = Some(device);
            Ok(device)
        });
        let device = result.as_ref().map(|d| *d).unwrap_or(DeviceHandle(0));
        self.record(DriverCall::Open(device), &result);
        result
    }

    fn close(&self, device: DeviceHandle) -> DriverResult<()> {
        let result = self.enter("close").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("close", device)?;
            if state.acquisition.is_some() {
                state.violations.push("close while acquisition running".to_string());
            }
            if !state.events.is_empty() {
                let count = state.events.len();
                state
                    .violations
                    .push(format!("close with {} event(s) still enabled", count));
            }
            if !state.buffers.is_empty() {
                let count = state.buffers.len();
                state
                    .violations
                    .push(format!("close with {} buffer(s) still allocated", count));
            }
            let status = std::mem::take(&mut state.status);
            let violations = std::mem::take(&mut state.violations);
            let next_device = state.next_device;
            let next_buffer_id = state.next_buffer_id;
            *state = MockState {
                next_device,
                next_buffer_id,
                status,
                violations,
                ..MockState::default()
            };
            self.wake.notify_all();
            Ok(())
        });
        self.record(DriverCall::Close, &result);
        result
    }

    fn sensor_info(&self, device: DeviceHandle) -> DriverResult<SensorInfo> {
        let result = self.enter("sensor_info").and_then(|_| {
            self.state.lock().require_device("sensor_info", device)?;
            Ok(self.config.sensor.clone())
        });
        self.record(DriverCall::SensorInfo, &result);
        result
    }

    fn arbitrary_aoi_supported(&self, device: DeviceHandle) -> DriverResult<bool> {
        let result = self.enter("arbitrary_aoi_supported").and_then(|_| {
            self.state
                .lock()
                .require_device("arbitrary_aoi_supported", device)?;
            Ok(self.config.arbitrary_aoi)
        });
        self.record(DriverCall::ArbitraryAoiSupported, &result);
        result
    }

    fn aoi_image_size(&self, device: DeviceHandle) -> DriverResult<ImageSize> {
        let result = self.enter("aoi_image_size").and_then(|_| {
            self.state.lock().require_device("aoi_image_size", device)?;
            Ok(self.config.aoi)
        });
        self.record(DriverCall::AoiImageSize, &result);
        result
    }

    fn allocate_buffer(
        &self,
        device: DeviceHandle,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> DriverResult<BufferAllocation> {
        let size = ImageSize::new(width, height);
        let bytes = size.frame_bytes(bits_per_pixel).unwrap_or(usize::MAX);
        let result = self.enter("allocate_buffer").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("allocate_buffer", device)?;
            if bytes == 0 {
                return Err(DriverError::semantic(
                    "allocate_buffer",
                    INVALID_PARAMETER,
                    format!("invalid geometry {}x{}", size, bits_per_pixel),
                ));
            }
            if bytes > self.config.max_allocation_bytes {
                return Err(DriverError::semantic(
                    "allocate_buffer",
                    OUT_OF_MEMORY,
                    format!(
                        "{} bytes exceeds limit of {} bytes",
                        bytes, self.config.max_allocation_bytes
                    ),
                ));
            }
            state.next_buffer_id += 1;
            let buffer = MockBuffer::new(
                BufferId(state.next_buffer_id),
                bytes,
                size,
                bits_per_pixel,
            );
            let allocation = BufferAllocation {
                memory: buffer.memory(),
                id: buffer.id,
                region: buffer.region(),
            };
            state.buffers.push(buffer);
            Ok(allocation)
        });
        let (memory, id) = result
            .as_ref()
            .map(|a| (a.memory, a.id))
            .unwrap_or((MemoryHandle(0), BufferId(0)));
        self.record(DriverCall::AllocateBuffer { memory, id, bytes }, &result);
        result
    }

    fn free_buffer(
        &self,
        device: DeviceHandle,
        memory: MemoryHandle,
        id: BufferId,
    ) -> DriverResult<()> {
        let result = self.enter("free_buffer").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("free_buffer", device)?;
            let pos = state.buffer_position("free_buffer", memory, id)?;
            if state.locked.contains_key(&memory) || state.sequence.contains(&memory) {
                state
                    .violations
                    .push(format!("free of memory {} still in the capture sequence", memory));
                return Err(DriverError::semantic(
                    "free_buffer",
                    SEQUENCE_BUF_ALREADY_LOCKED,
                    format!("memory {} is part of the capture sequence", memory),
                ));
            }
            state.buffers.remove(pos);
            Ok(())
        });
        self.record(DriverCall::FreeBuffer { memory, id }, &result);
        result
    }

    fn register_in_sequence(
        &self,
        device: DeviceHandle,
        memory: MemoryHandle,
        id: BufferId,
    ) -> DriverResult<()> {
        let result = self.enter("register_in_sequence").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("register_in_sequence", device)?;
            state.buffer_position("register_in_sequence", memory, id)?;
            if state.sequence.contains(&memory) {
                return Err(DriverError::semantic(
                    "register_in_sequence",
                    INVALID_PARAMETER,
                    format!("memory {} is already in the sequence", memory),
                ));
            }
            state.sequence.push(memory);
            Ok(())
        });
        self.record(DriverCall::RegisterInSequence { memory, id }, &result);
        result
    }

    fn clear_sequence(&self, device: DeviceHandle) -> DriverResult<()> {
        let result = self.enter("clear_sequence").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("clear_sequence", device)?;
            if state.acquisition.is_some() {
                state
                    .violations
                    .push("clear_sequence while acquisition running".to_string());
                return Err(DriverError::semantic(
                    "clear_sequence",
                    CAPTURE_RUNNING,
                    "acquisition is running",
                ));
            }
            if !state.locked.is_empty() {
                let count = state.locked.len();
                state
                    .violations
                    .push(format!("clear_sequence with {} locked buffer(s)", count));
            }
            state.sequence.clear();
            state.locked.clear();
            state.cursor = 0;
            state.last_completed = None;
            Ok(())
        });
        self.record(DriverCall::ClearSequence, &result);
        result
    }

    fn lock_buffer(
        &self,
        device: DeviceHandle,
        seq: SequenceNumber,
        memory: MemoryHandle,
    ) -> DriverResult<()> {
        let result = self.enter("lock_buffer").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("lock_buffer", device)?;
            if state.sequence_slot(memory) != Some(seq) {
                return Err(DriverError::semantic(
                    "lock_buffer",
                    INVALID_PARAMETER,
                    format!("memory {} is not sequence slot {}", memory, seq.0),
                ));
            }
            if state.locked.contains_key(&memory) {
                return Err(DriverError::semantic(
                    "lock_buffer",
                    SEQUENCE_BUF_ALREADY_LOCKED,
                    format!("slot {} is already locked", seq.0),
                ));
            }
            state.locked.insert(memory, seq);
            Ok(())
        });
        self.record(DriverCall::LockBuffer { seq, memory }, &result);
        result
    }

    fn unlock_buffer(
        &self,
        device: DeviceHandle,
        seq: SequenceNumber,
        memory: MemoryHandle,
    ) -> DriverResult<()> {
        let result = self.enter("unlock_buffer").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("unlock_buffer", device)?;
            match state.locked.get(&memory) {
                Some(locked_seq) if *locked_seq == seq => {
                    state.locked.remove(&memory);
                    self.wake.notify_all();
                    Ok(())
                }
                _ => Err(DriverError::semantic(
                    "unlock_buffer",
                    INVALID_PARAMETER,
                    format!("slot {} is not locked", seq.0),
                )),
            }
        });
        self.record(DriverCall::UnlockBuffer { seq, memory }, &result);
        result
    }

    fn active_buffer(&self, device: DeviceHandle) -> DriverResult<ActiveBuffer> {
        let result = self.enter("active_buffer").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("active_buffer", device)?;
            if let Some(foreign) = state.foreign_active.take() {
                return Ok(ActiveBuffer {
                    id: BufferId(0),
                    memory: foreign,
                    previous: foreign,
                });
            }
            let memory = state.sequence.get(state.cursor).copied().ok_or_else(|| {
                DriverError::semantic(
                    "active_buffer",
                    NO_ACTIVE_IMG_MEM,
                    "capture sequence is empty",
                )
            })?;
            let id = state
                .buffers
                .iter()
                .find(|b| b.memory() == memory)
                .map(|b| b.id)
                .unwrap_or(BufferId(0));
            Ok(ActiveBuffer {
                id,
                memory,
                previous: state.last_completed.unwrap_or(MemoryHandle(0)),
            })
        });
        self.record(DriverCall::ActiveBuffer, &result);
        result
    }

    fn enable_event(&self, device: DeviceHandle, event: EventId) -> DriverResult<()> {
        let result = self.enter("enable_event").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("enable_event", device)?;
            state.events.insert(event);
            Ok(())
        });
        self.record(DriverCall::EnableEvent(event), &result);
        result
    }

    fn disable_event(&self, device: DeviceHandle, event: EventId) -> DriverResult<()> {
        let result = self.enter("disable_event").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("disable_event", device)?;
            state.events.remove(&event);
            self.wake.notify_all();
            Ok(())
        });
        self.record(DriverCall::DisableEvent(event), &result);
        result
    }

    fn wait_event(
        &self,
        device: DeviceHandle,
        event: EventId,
        timeout_ms: u32,
    ) -> DriverResult<WaitOutcome> {
        let result = self
            .enter("wait_event")
            .and_then(|_| self.wait_locked(device, event, timeout_ms));
        self.record(
            DriverCall::WaitEvent {
                event,
                outcome: result.as_ref().ok().copied(),
            },
            &result,
        );
        result
    }

    fn start_acquisition(&self, device: DeviceHandle, mode: AcquisitionMode) -> DriverResult<()> {
        let result = self.enter("start_acquisition").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("start_acquisition", device)?;
            if state.acquisition.is_some() {
                return Err(DriverError::semantic(
                    "start_acquisition",
                    CAPTURE_RUNNING,
                    "acquisition already running",
                ));
            }
            if state.sequence.is_empty() {
                return Err(DriverError::semantic(
                    "start_acquisition",
                    NO_ACTIVE_IMG_MEM,
                    "no image memory in the capture sequence",
                ));
            }
            state.acquisition = Some(mode);
            state.next_frame_due = None;
            if mode == AcquisitionMode::SingleShot {
                *state.pending.entry(EventId::FRAME).or_insert(0) += 1;
            }
            self.wake.notify_all();
            Ok(())
        });
        self.record(DriverCall::StartAcquisition(mode), &result);
        result
    }

    fn stop_acquisition(&self, device: DeviceHandle) -> DriverResult<()> {
        let result = self.enter("stop_acquisition").and_then(|_| {
            let mut state = self.state.lock();
            state.require_device("stop_acquisition", device)?;
            state.acquisition = None;
            state.next_frame_due = None;
            Ok(())
        });
        self.record(DriverCall::StopAcquisition, &result);
        result
    }

    fn capture_status(&self, device: DeviceHandle) -> DriverResult<CaptureStatus> {
        let result = self.enter("capture_status").and_then(|_| {
            let state = self.state.lock();
            state.require_device("capture_status", device)?;
            Ok(state.status.clone())
        });
        self.record(DriverCall::CaptureStatus, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    fn open_with_sequence(gw: &MockGateway, count: usize) -> (DeviceHandle, Vec<BufferAllocation>) {
        let dev = gw.open().unwrap();
        let allocs: Vec<_> = (0..count)
            .map(|_| gw.allocate_buffer(dev, 64, 48, 8).unwrap())
            .collect();
        for a in &allocs {
            gw.register_in_sequence(dev, a.memory, a.id).unwrap();
        }
        (dev, allocs)
    }

    #[test]
    fn test_allocation_limits() {
        let gw = MockGateway::builder().max_allocation_bytes(1024).build();
        let dev = gw.open().unwrap();
        let err = gw.allocate_buffer(dev, 640, 480, 8).unwrap_err();
        assert_eq!(err.code, Some(OUT_OF_MEMORY));
        let err = gw.allocate_buffer(dev, 0, 480, 8).unwrap_err();
        assert_eq!(err.code, Some(INVALID_PARAMETER));
        assert!(gw.allocate_buffer(dev, 32, 32, 8).is_ok());
    }

    #[test]
    fn test_invalid_device_rejected() {
        let gw = MockGateway::new();
        let err = gw.allocate_buffer(DeviceHandle(99), 8, 8, 8).unwrap_err();
        assert!(err.is_semantic());
        assert_eq!(err.code, Some(INVALID_CAMERA_HANDLE));
    }

    #[test]
    fn test_frames_rotate_through_sequence() {
        let gw = MockGateway::new();
        let (dev, allocs) = open_with_sequence(&gw, 3);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::Continuous).unwrap();

        let mut completed = Vec::new();
        for _ in 0..4 {
            gw.trigger(EventId::FRAME);
            assert_eq!(gw.wait_event(dev, EventId::FRAME, 10).unwrap(), WaitOutcome::Fired);
            completed.push(gw.active_buffer(dev).unwrap().previous);
        }
        assert_eq!(
            completed,
            vec![allocs[0].memory, allocs[1].memory, allocs[2].memory, allocs[0].memory]
        );
    }

    #[test]
    fn test_locked_buffer_is_skipped() {
        let gw = MockGateway::new();
        let (dev, allocs) = open_with_sequence(&gw, 2);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::Continuous).unwrap();
        gw.lock_buffer(dev, SequenceNumber(1), allocs[0].memory).unwrap();

        gw.trigger(EventId::FRAME);
        gw.wait_event(dev, EventId::FRAME, 10).unwrap();
        assert_eq!(gw.active_buffer(dev).unwrap().previous, allocs[1].memory);
    }

    #[test]
    fn test_wait_times_out_without_frames() {
        let gw = MockGateway::new();
        let (dev, _) = open_with_sequence(&gw, 1);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        assert_eq!(gw.wait_event(dev, EventId::FRAME, 5).unwrap(), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_requires_enabled_event() {
        let gw = MockGateway::new();
        let dev = gw.open().unwrap();
        let err = gw.wait_event(dev, EventId::FRAME, 5).unwrap_err();
        assert_eq!(err.code, Some(EVENT_NOT_ENABLED));
    }

    #[test]
    fn test_scripted_waits_in_order() {
        let gw = MockGateway::new();
        let dev = gw.open().unwrap();
        gw.enable_event(dev, EventId::SEQUENCE).unwrap();
        gw.script_waits(
            EventId::SEQUENCE,
            [
                ScriptedWait::Timeout,
                ScriptedWait::Error(DriverErrorKind::Transport),
                ScriptedWait::Fire,
            ],
        );
        assert_eq!(gw.wait_event(dev, EventId::SEQUENCE, 1000).unwrap(), WaitOutcome::TimedOut);
        assert!(gw.wait_event(dev, EventId::SEQUENCE, 1000).unwrap_err().is_transport());
        assert_eq!(gw.wait_event(dev, EventId::SEQUENCE, 1000).unwrap(), WaitOutcome::Fired);
    }

    #[test]
    fn test_free_while_registered_is_violation() {
        let gw = MockGateway::new();
        let (dev, allocs) = open_with_sequence(&gw, 1);
        assert!(gw.free_buffer(dev, allocs[0].memory, allocs[0].id).is_err());
        assert_eq!(gw.violations().len(), 1);

        gw.clear_sequence(dev).unwrap();
        gw.free_buffer(dev, allocs[0].memory, allocs[0].id).unwrap();
        assert_eq!(gw.allocated_buffers(), 0);
    }

    #[test]
    fn test_close_records_leaks() {
        let gw = MockGateway::new();
        let (dev, _) = open_with_sequence(&gw, 2);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.close(dev).unwrap();
        let violations = gw.violations();
        assert_eq!(violations.len(), 2, "{violations:?}");
        assert!(!gw.is_open());
    }

    #[test]
    fn test_single_shot_captures_one_frame() {
        let gw = MockGateway::new();
        let (dev, allocs) = open_with_sequence(&gw, 2);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::SingleShot).unwrap();
        assert_eq!(gw.wait_event(dev, EventId::FRAME, 10).unwrap(), WaitOutcome::Fired);
        assert_eq!(gw.active_buffer(dev).unwrap().previous, allocs[0].memory);
        assert!(!gw.is_acquiring());
        assert_eq!(gw.wait_event(dev, EventId::FRAME, 5).unwrap(), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_realistic_mode_free_runs() {
        let gw = MockGateway::builder()
            .mode(MockMode::Realistic)
            .timing_config(TimingConfig::with_fps(200.0))
            .build();
        let (dev, _) = open_with_sequence(&gw, 3);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::Continuous).unwrap();
        for _ in 0..3 {
            assert_eq!(gw.wait_event(dev, EventId::FRAME, 1000).unwrap(), WaitOutcome::Fired);
        }
        assert_eq!(gw.frames_captured(), 3);
    }

    #[test]
    fn test_chaos_mode_misses_readouts() {
        let gw = MockGateway::builder()
            .mode(MockMode::Chaos)
            .timing_config(TimingConfig::with_fps(500.0))
            .chaos(ChaosConfig {
                missed_frame_rate: 1.0,
                jitter: 0.5,
                seed: Some(9),
            })
            .build();
        let (dev, _) = open_with_sequence(&gw, 2);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::Continuous).unwrap();

        assert_eq!(gw.wait_event(dev, EventId::FRAME, 50).unwrap(), WaitOutcome::TimedOut);
        assert_eq!(gw.frames_captured(), 0);
        let missed = gw.capture_status(dev).unwrap().count(CaptureFault::DeviceMissedImages);
        assert!(missed > 0);
    }

    #[test]
    fn test_chaos_mode_without_misses_still_streams() {
        let gw = MockGateway::builder()
            .mode(MockMode::Chaos)
            .timing_config(TimingConfig::with_fps(200.0))
            .chaos(ChaosConfig {
                missed_frame_rate: 0.0,
                jitter: 0.5,
                seed: Some(1),
            })
            .build();
        let (dev, _) = open_with_sequence(&gw, 3);
        gw.enable_event(dev, EventId::FRAME).unwrap();
        gw.start_acquisition(dev, AcquisitionMode::Continuous).unwrap();
        for _ in 0..4 {
            assert_eq!(gw.wait_event(dev, EventId::FRAME, 1000).unwrap(), WaitOutcome::Fired);
        }
        assert!(gw.capture_status(dev).unwrap().is_clean());
    }

    #[test]
    fn test_injected_errors_are_journaled() {
        let gw = MockGateway::builder()
            .error_config(ErrorConfig::scenario(ErrorScenario::Always {
                operation: "stop_acquisition",
                kind: DriverErrorKind::Transport,
            }))
            .build();
        let dev = gw.open().unwrap();
        assert!(gw.stop_acquisition(dev).unwrap_err().is_transport());
        let journal = gw.journal();
        assert_eq!(
            journal.last(),
            Some(&JournalEntry {
                call: DriverCall::StopAcquisition,
                ok: false
            })
        );
        assert_eq!(gw.calls(), vec![DriverCall::Open(dev)]);
    }

    #[test]
    fn test_capture_status_counts_faults() {
        let gw = MockGateway::new();
        let dev = gw.open().unwrap();
        gw.record_capture_fault(CaptureFault::DeviceMissedImages, 2);
        let status = gw.capture_status(dev).unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.count(CaptureFault::DeviceMissedImages), 2);
    }
}
