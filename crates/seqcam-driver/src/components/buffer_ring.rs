//! Buffer ring for sequence capture.
//!
//! The driver writes frames into a fixed set of image buffers that it cycles
//! through in registration order (the capture sequence). `BufferRing` owns the
//! bookkeeping for those buffers:
//!
//! - indices are assigned in allocation order and are never reused within a
//!   session (the ring is append-only until [`BufferRing::reset`])
//! - every buffer carries a [`BufferState`]; transitions that the driver would
//!   punish with undefined behaviour are rejected here, before any driver call
//! - driver memory handles are mapped back to indices by linear scan, which is
//!   fine for the handful of buffers a sequence uses
//!
//! # State machine
//!
//! ```text
//! allocate ─► Allocated ─register─► Registered ─lock─► Locked
//!                 ▲                   │  ▲               │
//!                 └──clear_sequence───┘  └────unlock─────┘
//!             Allocated ─free─► Freed
//! ```

use parking_lot::Mutex;
use seqcam_core::{
    BufferId, CaptureError, CaptureResult, DeviceHandle, DriverGateway, ImageSize, MemoryHandle,
    PixelRegion, SequenceNumber,
};
use std::sync::Arc;

/// Ring shared between the lifecycle controller and frame delivery.
pub type SharedRing = Arc<Mutex<BufferRing>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated, not part of the capture sequence.
    Allocated,
    /// In the capture sequence; the driver may write into it.
    Registered,
    /// Locked for read; the driver skips it.
    Locked,
    /// Released back to the driver. Terminal.
    Freed,
}

impl BufferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferState::Allocated => "allocated",
            BufferState::Registered => "registered",
            BufferState::Locked => "locked",
            BufferState::Freed => "freed",
        }
    }
}

/// One driver-owned frame buffer.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub index: usize,
    pub memory: MemoryHandle,
    pub id: BufferId,
    pub region: PixelRegion,
    pub size: ImageSize,
    pub bits_per_pixel: u32,
    pub state: BufferState,
    /// Capture sequence slot while registered or locked.
    pub sequence: Option<SequenceNumber>,
}

impl FrameBuffer {
    pub fn byte_len(&self) -> usize {
        self.region.len()
    }

    pub fn is_live(&self) -> bool {
        self.state != BufferState::Freed
    }
}

pub struct BufferRing {
    gateway: Arc<dyn DriverGateway>,
    buffers: Vec<FrameBuffer>,
    next_slot: u32,
    ever_registered: bool,
}

impl BufferRing {
    pub fn new(gateway: Arc<dyn DriverGateway>) -> Self {
        Self {
            gateway,
            buffers: Vec::new(),
            next_slot: 0,
            ever_registered: false,
        }
    }

    pub fn shared(gateway: Arc<dyn DriverGateway>) -> SharedRing {
        Arc::new(Mutex::new(Self::new(gateway)))
    }

    /// Allocate a `width * height * bits_per_pixel / 8` byte buffer and append it.
    pub fn allocate(
        &mut self,
        device: DeviceHandle,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> CaptureResult<usize> {
        let size = ImageSize::new(width, height);
        let bytes = size
            .frame_bytes(bits_per_pixel)
            .ok_or(CaptureError::SizeOverflow {
                width,
                height,
                bits_per_pixel,
            })?;

        let allocation = self
            .gateway
            .allocate_buffer(device, width, height, bits_per_pixel)
            .map_err(|source| CaptureError::Allocation { bytes, source })?;

        let index = self.buffers.len();
        self.buffers.push(FrameBuffer {
            index,
            memory: allocation.memory,
            id: allocation.id,
            region: allocation.region,
            size,
            bits_per_pixel,
            state: BufferState::Allocated,
            sequence: None,
        });
        tracing::debug!(
            index,
            buffer_id = allocation.id.0,
            memory = %allocation.memory,
            bytes,
            "allocated frame buffer"
        );
        Ok(index)
    }

    /// Map a driver memory handle back to its buffer index.
    ///
    /// Freed buffers never resolve; the driver may hand their address out again.
    pub fn resolve(&self, memory: MemoryHandle) -> CaptureResult<usize> {
        self.buffers
            .iter()
            .find(|b| b.is_live() && b.memory == memory)
            .map(|b| b.index)
            .ok_or(CaptureError::Resolution(memory))
    }

    /// Append a buffer to the capture sequence; returns its 1-based slot.
    pub fn register(&mut self, device: DeviceHandle, index: usize) -> CaptureResult<SequenceNumber> {
        let buffer = self.live(index)?;
        match buffer.state {
            BufferState::Allocated => {}
            BufferState::Registered | BufferState::Locked => {
                return Err(CaptureError::AlreadyRegistered(index))
            }
            BufferState::Freed => return Err(CaptureError::BufferFreed(index)),
        }
        let (memory, id) = (buffer.memory, buffer.id);

        self.gateway.register_in_sequence(device, memory, id)?;

        self.next_slot += 1;
        let seq = SequenceNumber(self.next_slot);
        self.ever_registered = true;
        let buffer = &mut self.buffers[index];
        buffer.state = BufferState::Registered;
        buffer.sequence = Some(seq);
        tracing::debug!(index, seq = seq.0, "registered buffer in capture sequence");
        Ok(seq)
    }

    /// Lock a registered buffer for read.
    pub fn lock(&mut self, device: DeviceHandle, index: usize) -> CaptureResult<SequenceNumber> {
        let buffer = self.live(index)?;
        let seq = match (buffer.state, buffer.sequence) {
            (BufferState::Registered, Some(seq)) => seq,
            (BufferState::Locked, _) => return Err(CaptureError::BufferLocked(index)),
            _ => return Err(CaptureError::NotRegistered(index)),
        };

        self.gateway.lock_buffer(device, seq, buffer.memory)?;
        self.buffers[index].state = BufferState::Locked;
        tracing::trace!(index, seq = seq.0, "buffer locked");
        Ok(seq)
    }

    /// Hand a locked buffer back to the capture sequence.
    ///
    /// If the driver refuses, the buffer stays `Locked` until the sequence is cleared.
    pub fn unlock(&mut self, device: DeviceHandle, index: usize) -> CaptureResult<()> {
        let buffer = self.live(index)?;
        let seq = match (buffer.state, buffer.sequence) {
            (BufferState::Locked, Some(seq)) => seq,
            _ => return Err(CaptureError::NotLocked(index)),
        };

        self.gateway.unlock_buffer(device, seq, buffer.memory)?;
        self.buffers[index].state = BufferState::Registered;
        tracing::trace!(index, seq = seq.0, "buffer unlocked");
        Ok(())
    }

    /// Remove every buffer from the capture sequence.
    ///
    /// Clearing also drops the driver's read locks, so a buffer left `Locked`
    /// by a failed unlock comes back as `Allocated` and can be freed.
    pub fn clear_sequence(&mut self, device: DeviceHandle) -> CaptureResult<()> {
        self.gateway.clear_sequence(device)?;
        let locked: Vec<usize> = self
            .buffers
            .iter()
            .filter(|b| b.state == BufferState::Locked)
            .map(|b| b.index)
            .collect();
        if !locked.is_empty() {
            tracing::warn!(?locked, "capture sequence cleared with locked buffers");
        }
        for buffer in self.buffers.iter_mut().filter(|b| b.is_live()) {
            buffer.state = BufferState::Allocated;
            buffer.sequence = None;
        }
        self.next_slot = 0;
        Ok(())
    }

    /// Release a buffer back to the driver. The index is never reused.
    pub fn free(&mut self, device: DeviceHandle, index: usize) -> CaptureResult<()> {
        let buffer = self.live(index)?;
        match buffer.state {
            BufferState::Allocated => {}
            BufferState::Registered => return Err(CaptureError::BufferRegistered(index)),
            BufferState::Locked => return Err(CaptureError::BufferLocked(index)),
            BufferState::Freed => return Err(CaptureError::BufferFreed(index)),
        }

        self.gateway.free_buffer(device, buffer.memory, buffer.id)?;
        self.buffers[index].state = BufferState::Freed;
        tracing::debug!(index, "freed frame buffer");
        Ok(())
    }

    /// Forget every buffer. Only valid once the device is closed.
    pub fn reset(&mut self) {
        let leaked = self.buffers.iter().filter(|b| b.is_live()).count();
        if leaked > 0 {
            tracing::warn!(leaked, "resetting buffer ring with unreleased buffers");
        }
        self.buffers.clear();
        self.next_slot = 0;
        self.ever_registered = false;
    }

    pub fn get(&self, index: usize) -> Option<&FrameBuffer> {
        self.buffers.get(index)
    }

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.buffers.get(index).map(|b| b.state)
    }

    pub fn buffers(&self) -> &[FrameBuffer] {
        &self.buffers
    }

    /// Indices of buffers not yet freed, in allocation order.
    pub fn live_indices(&self) -> Vec<usize> {
        self.buffers
            .iter()
            .filter(|b| b.is_live())
            .map(|b| b.index)
            .collect()
    }

    /// Total buffers ever allocated this session, freed ones included.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    /// Whether any buffer was registered since the last reset.
    pub fn ever_registered(&self) -> bool {
        self.ever_registered
    }

    fn live(&self, index: usize) -> CaptureResult<&FrameBuffer> {
        let buffer = self
            .buffers
            .get(index)
            .ok_or(CaptureError::UnknownBuffer(index))?;
        if buffer.state == BufferState::Freed {
            return Err(CaptureError::BufferFreed(index));
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRing")
            .field("gateway", &self.gateway.name())
            .field("buffers", &self.buffers.len())
            .field("next_slot", &self.next_slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcam_driver_mock::{DriverCall, MockGateway};

    fn ring_with_device() -> (Arc<MockGateway>, BufferRing, DeviceHandle) {
        let mock = Arc::new(MockGateway::new());
        let device = mock.open().unwrap();
        let ring = BufferRing::new(mock.clone());
        (mock, ring, device)
    }

    #[test]
    fn test_indices_follow_allocation_order() {
        let (_mock, mut ring, dev) = ring_with_device();
        let indices: Vec<_> = (0..4)
            .map(|_| ring.allocate(dev, 64, 48, 8).unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(ring.get(2).unwrap().byte_len(), 64 * 48);
    }

    #[test]
    fn test_freed_index_is_not_reused() {
        let (_mock, mut ring, dev) = ring_with_device();
        let a = ring.allocate(dev, 8, 8, 8).unwrap();
        ring.free(dev, a).unwrap();
        let b = ring.allocate(dev, 8, 8, 8).unwrap();
        assert_eq!(b, 1);
        assert!(matches!(ring.free(dev, a), Err(CaptureError::BufferFreed(0))));
        assert_eq!(ring.live_indices(), vec![1]);
    }

    #[test]
    fn test_every_allocation_resolves_to_its_index() {
        let (_mock, mut ring, dev) = ring_with_device();
        for _ in 0..5 {
            ring.allocate(dev, 16, 16, 16).unwrap();
        }
        for buffer in ring.buffers() {
            assert_eq!(ring.resolve(buffer.memory).unwrap(), buffer.index);
        }
        let err = ring.resolve(MemoryHandle(0x1)).unwrap_err();
        assert!(err.is_resolution());
    }

    #[test]
    fn test_double_registration_rejected_before_driver() {
        let (mock, mut ring, dev) = ring_with_device();
        let idx = ring.allocate(dev, 8, 8, 8).unwrap();
        assert_eq!(ring.register(dev, idx).unwrap(), SequenceNumber(1));

        mock.clear_journal();
        let err = ring.register(dev, idx).unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyRegistered(0)));
        assert!(err.is_semantic());
        assert!(mock.journal().is_empty(), "driver must not see the second registration");
    }

    #[test]
    fn test_sequence_numbers_are_registration_positions() {
        let (_mock, mut ring, dev) = ring_with_device();
        for _ in 0..3 {
            ring.allocate(dev, 8, 8, 8).unwrap();
        }
        // Register out of allocation order.
        assert_eq!(ring.register(dev, 2).unwrap(), SequenceNumber(1));
        assert_eq!(ring.register(dev, 0).unwrap(), SequenceNumber(2));
        assert_eq!(ring.register(dev, 1).unwrap(), SequenceNumber(3));
    }

    #[test]
    fn test_locked_buffer_cannot_be_freed() {
        let (mock, mut ring, dev) = ring_with_device();
        let idx = ring.allocate(dev, 8, 8, 8).unwrap();
        ring.register(dev, idx).unwrap();
        ring.lock(dev, idx).unwrap();

        assert!(matches!(ring.free(dev, idx), Err(CaptureError::BufferLocked(0))));
        assert!(matches!(ring.lock(dev, idx), Err(CaptureError::BufferLocked(0))));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::FreeBuffer { .. })));
        assert!(mock.violations().is_empty());
    }

    #[test]
    fn test_registered_buffer_cannot_be_freed_until_cleared() {
        let (mock, mut ring, dev) = ring_with_device();
        let idx = ring.allocate(dev, 8, 8, 8).unwrap();
        ring.register(dev, idx).unwrap();
        assert!(matches!(ring.free(dev, idx), Err(CaptureError::BufferRegistered(0))));

        ring.clear_sequence(dev).unwrap();
        assert_eq!(ring.state(idx), Some(BufferState::Allocated));
        ring.free(dev, idx).unwrap();
        assert!(mock.violations().is_empty());
    }

    #[test]
    fn test_clear_releases_buffer_left_locked() {
        let (mock, mut ring, dev) = ring_with_device();
        let idx = ring.allocate(dev, 8, 8, 8).unwrap();
        ring.register(dev, idx).unwrap();
        ring.lock(dev, idx).unwrap();

        ring.clear_sequence(dev).unwrap();
        assert_eq!(ring.state(idx), Some(BufferState::Allocated));
        assert_eq!(ring.get(idx).unwrap().sequence, None);
        ring.free(dev, idx).unwrap();
        assert_eq!(
            mock.violations(),
            vec!["clear_sequence with 1 locked buffer(s)".to_string()]
        );
    }

    #[test]
    fn test_lock_unlock_cycle() {
        let (_mock, mut ring, dev) = ring_with_device();
        let idx = ring.allocate(dev, 8, 8, 8).unwrap();
        assert!(matches!(ring.lock(dev, idx), Err(CaptureError::NotRegistered(0))));
        ring.register(dev, idx).unwrap();
        assert!(matches!(ring.unlock(dev, idx), Err(CaptureError::NotLocked(0))));

        ring.lock(dev, idx).unwrap();
        assert_eq!(ring.count_in(BufferState::Locked), 1);
        ring.unlock(dev, idx).unwrap();
        assert_eq!(ring.state(idx), Some(BufferState::Registered));
    }

    #[test]
    fn test_unknown_index() {
        let (_mock, mut ring, dev) = ring_with_device();
        assert!(matches!(ring.register(dev, 7), Err(CaptureError::UnknownBuffer(7))));
    }

    #[test]
    fn test_allocation_failure_carries_size() {
        let mock = Arc::new(MockGateway::builder().max_allocation_bytes(100).build());
        let dev = mock.open().unwrap();
        let mut ring = BufferRing::new(mock.clone());
        match ring.allocate(dev, 640, 480, 8) {
            Err(CaptureError::Allocation { bytes, source }) => {
                assert_eq!(bytes, 307_200);
                assert!(source.is_semantic());
            }
            other => panic!("expected allocation error, got {other:?}"),
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_size_overflow_never_reaches_driver() {
        let (mock, mut ring, dev) = ring_with_device();
        mock.clear_journal();
        if usize::BITS == 64 {
            let err = ring.allocate(dev, u32::MAX, u32::MAX, 32).unwrap_err();
            assert!(matches!(err, CaptureError::SizeOverflow { .. }));
            assert!(mock.journal().is_empty());
        }
    }
}
