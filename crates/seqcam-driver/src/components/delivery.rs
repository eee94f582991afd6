//! Frame delivery: lock, hand to the consumer, unlock.
//!
//! Runs once per frame event:
//!
//! 1. ask the driver for the active buffer; its `previous` handle names the
//!    most recently completed frame
//! 2. resolve that handle to a ring index (unresolved frames are skipped)
//! 3. lock the buffer so the driver stops writing into it
//! 4. hand the consumer a [`LockedFrame`]
//! 5. unlock once the consumer releases the frame
//!
//! The delivery future only completes after the frame is released, and the
//! event loop does not re-arm before that. Frames of one event therefore reach
//! the consumer in order, with at most one buffer locked at a time.

use crate::components::buffer_ring::SharedRing;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use seqcam_core::{
    BufferId, CaptureResult, DeviceHandle, DriverGateway, ImageSize, MemoryHandle, PixelRegion,
    SequenceNumber,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How often to warn while a consumer holds a frame.
const RELEASE_WARN_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// LockedFrame
// =============================================================================

struct Releaser {
    ring: SharedRing,
    device: DeviceHandle,
    done: oneshot::Sender<()>,
}

/// A completed frame whose buffer is locked for read.
///
/// The buffer goes back to the capture sequence on [`LockedFrame::release`].
/// Dropping an unreleased frame also unlocks it, with a warning.
pub struct LockedFrame {
    index: usize,
    id: BufferId,
    seq: SequenceNumber,
    memory: MemoryHandle,
    region: PixelRegion,
    size: ImageSize,
    bits_per_pixel: u32,
    frame_number: u64,
    wrapped: bool,
    releaser: Option<Releaser>,
}

impl LockedFrame {
    /// Ring index of the buffer holding this frame.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn buffer_id(&self) -> BufferId {
        self.id
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.seq
    }

    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// 1-based count of frames delivered this session.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Whether the capture sequence wrapped around since the previous frame.
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Pixel bytes, exactly as the driver wrote them.
    #[allow(unsafe_code)]
    pub fn pixels(&self) -> &[u8] {
        // SAFETY: the buffer is locked until this frame is released or dropped,
        // so the driver does not write into it, and the ring refuses to free a
        // locked buffer.
        unsafe { self.region.as_slice() }
    }

    /// Unlock the buffer and return it to the capture sequence.
    pub fn release(mut self) -> CaptureResult<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> CaptureResult<()> {
        let Some(releaser) = self.releaser.take() else {
            return Ok(());
        };
        let result = releaser.ring.lock().unlock(releaser.device, self.index);
        if let Err(e) = &result {
            tracing::warn!(index = self.index, seq = self.seq.0, error = %e, "unlock failed");
        }
        let _ = releaser.done.send(());
        result
    }
}

impl Drop for LockedFrame {
    fn drop(&mut self) {
        if self.releaser.is_some() {
            tracing::warn!(
                index = self.index,
                frame = self.frame_number,
                "frame dropped without release; unlocking"
            );
            let _ = self.unlock();
        }
    }
}

impl std::fmt::Debug for LockedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedFrame")
            .field("index", &self.index)
            .field("seq", &self.seq.0)
            .field("frame_number", &self.frame_number)
            .field("size", &self.size)
            .field("bits_per_pixel", &self.bits_per_pixel)
            .field("released", &self.releaser.is_none())
            .finish()
    }
}

// =============================================================================
// Consumers
// =============================================================================

/// Receives each delivered frame.
///
/// The event does not re-arm until the frame is released, so a consumer that
/// holds frames stalls acquisition. Hand off to a channel
/// ([`ChannelConsumer`]) when processing is slow.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, frame: LockedFrame) -> BoxFuture<'_, CaptureResult<()>>;

    fn name(&self) -> &'static str {
        "unnamed_consumer"
    }
}

/// Consumer built from a synchronous closure.
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F>
where
    F: Fn(LockedFrame) -> CaptureResult<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> FrameConsumer for FnConsumer<F>
where
    F: Fn(LockedFrame) -> CaptureResult<()> + Send + Sync,
{
    fn on_frame(&self, frame: LockedFrame) -> BoxFuture<'_, CaptureResult<()>> {
        let result = (self.f)(frame);
        async move { result }.boxed()
    }

    fn name(&self) -> &'static str {
        "fn_consumer"
    }
}

/// Forwards frames to a tokio channel.
///
/// Frames that cannot be queued (channel full or closed) are released at once
/// and counted as dropped.
pub struct ChannelConsumer {
    tx: mpsc::Sender<LockedFrame>,
    dropped: AtomicU64,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LockedFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameConsumer for ChannelConsumer {
    fn on_frame(&self, frame: LockedFrame) -> BoxFuture<'_, CaptureResult<()>> {
        let result = match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame))
            | Err(mpsc::error::TrySendError::Closed(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(index = frame.index(), "frame channel unavailable; dropping frame");
                frame.release()
            }
        };
        async move { result }.boxed()
    }

    fn name(&self) -> &'static str {
        "channel_consumer"
    }
}

// =============================================================================
// FrameDelivery
// =============================================================================

#[derive(Debug, Default)]
struct DeliveryCounters {
    delivered: AtomicU64,
    skipped: AtomicU64,
    wraparounds: AtomicU64,
    lock_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    /// Firings whose buffer could not be resolved.
    pub skipped: u64,
    pub wraparounds: u64,
    pub lock_failures: u64,
}

/// What one delivery attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { index: usize, frame_number: u64 },
    Skipped,
}

/// Per-firing lock/deliver/unlock for one device.
pub struct FrameDelivery {
    gateway: Arc<dyn DriverGateway>,
    device: DeviceHandle,
    ring: SharedRing,
    consumer: Arc<dyn FrameConsumer>,
    counters: DeliveryCounters,
    last_index: Mutex<Option<usize>>,
}

impl FrameDelivery {
    pub fn new(
        gateway: Arc<dyn DriverGateway>,
        device: DeviceHandle,
        ring: SharedRing,
        consumer: Arc<dyn FrameConsumer>,
    ) -> Self {
        Self {
            gateway,
            device,
            ring,
            consumer,
            counters: DeliveryCounters::default(),
            last_index: Mutex::new(None),
        }
    }

    /// Deliver the most recently completed frame.
    ///
    /// Resolves only after the consumer released the frame.
    pub async fn deliver_next(&self) -> CaptureResult<DeliveryOutcome> {
        let active = self.gateway.active_buffer(self.device)?;

        let (index, seq, buffer) = {
            let mut ring = self.ring.lock();
            let index = match ring.resolve(active.previous) {
                Ok(index) => index,
                Err(e) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        memory = %active.previous,
                        error = %e,
                        "completed buffer not in ring; skipping frame"
                    );
                    return Ok(DeliveryOutcome::Skipped);
                }
            };
            let seq = match ring.lock(self.device, index) {
                Ok(seq) => seq,
                Err(e) => {
                    self.counters.lock_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            match ring.get(index) {
                Some(buffer) => (index, seq, buffer.clone()),
                None => return Err(seqcam_core::CaptureError::UnknownBuffer(index)),
            }
        };

        let wrapped = {
            let mut last = self.last_index.lock();
            let wrapped = matches!(*last, Some(prev) if index < prev);
            *last = Some(index);
            wrapped
        };
        if wrapped {
            self.counters.wraparounds.fetch_add(1, Ordering::Relaxed);
        }
        let frame_number = self.counters.delivered.fetch_add(1, Ordering::Relaxed) + 1;

        let (done, released) = oneshot::channel();
        let frame = LockedFrame {
            index,
            id: buffer.id,
            seq,
            memory: buffer.memory,
            region: buffer.region,
            size: buffer.size,
            bits_per_pixel: buffer.bits_per_pixel,
            frame_number,
            wrapped,
            releaser: Some(Releaser {
                ring: self.ring.clone(),
                device: self.device,
                done,
            }),
        };

        tracing::debug!(
            index,
            seq = seq.0,
            frame = frame_number,
            consumer = self.consumer.name(),
            "delivering frame"
        );
        let consumed = self.consumer.on_frame(frame).await;
        wait_for_release(released, index).await;

        consumed.map(|()| DeliveryOutcome::Delivered {
            index,
            frame_number,
        })
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            wraparounds: self.counters.wraparounds.load(Ordering::Relaxed),
            lock_failures: self.counters.lock_failures.load(Ordering::Relaxed),
        }
    }
}

async fn wait_for_release(mut released: oneshot::Receiver<()>, index: usize) {
    loop {
        match tokio::time::timeout(RELEASE_WARN_INTERVAL, &mut released).await {
            Ok(_) => return,
            Err(_) => tracing::warn!(index, "consumer still holds frame; event stays disarmed"),
        }
    }
}

impl std::fmt::Debug for FrameDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDelivery")
            .field("device", &self.device)
            .field("consumer", &self.consumer.name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::buffer_ring::{BufferRing, BufferState};
    use seqcam_core::{AcquisitionMode, CaptureError, EventId};
    use seqcam_driver_mock::{read_frame_stamp, DriverCall, MockGateway};

    struct Fixture {
        mock: Arc<MockGateway>,
        device: DeviceHandle,
        ring: SharedRing,
    }

    fn fixture(buffers: usize) -> Fixture {
        let mock = Arc::new(MockGateway::new());
        let device = mock.open().unwrap();
        let ring = BufferRing::shared(mock.clone());
        {
            let mut r = ring.lock();
            for _ in 0..buffers {
                let idx = r.allocate(device, 32, 8, 8).unwrap();
                r.register(device, idx).unwrap();
            }
        }
        mock.enable_event(device, EventId::FRAME).unwrap();
        mock.start_acquisition(device, AcquisitionMode::Continuous).unwrap();
        Fixture { mock, device, ring }
    }

    impl Fixture {
        fn capture(&self) {
            self.mock.trigger(EventId::FRAME);
            self.mock.wait_event(self.device, EventId::FRAME, 10).unwrap();
        }

        fn delivery(&self, consumer: Arc<dyn FrameConsumer>) -> FrameDelivery {
            FrameDelivery::new(self.mock.clone(), self.device, self.ring.clone(), consumer)
        }
    }

    #[tokio::test]
    async fn test_delivers_completed_buffer_and_unlocks() {
        let fx = fixture(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let delivery = fx.delivery(Arc::new(FnConsumer::new(move |frame: LockedFrame| {
            sink.lock()
                .push((frame.index(), read_frame_stamp(frame.pixels())));
            frame.release()
        })));

        fx.capture();
        let outcome = delivery.deliver_next().await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Delivered {
                index: 0,
                frame_number: 1
            }
        );
        assert_eq!(*seen.lock(), vec![(0, Some(1))]);
        assert_eq!(fx.ring.lock().count_in(BufferState::Locked), 0);

        let calls = fx.mock.calls();
        let lock = calls
            .iter()
            .position(|c| matches!(c, DriverCall::LockBuffer { .. }))
            .unwrap();
        let unlock = calls
            .iter()
            .position(|c| matches!(c, DriverCall::UnlockBuffer { .. }))
            .unwrap();
        assert!(lock < unlock);
    }

    #[tokio::test]
    async fn test_unresolved_handle_is_skipped() {
        let fx = fixture(2);
        let called = Arc::new(AtomicU64::new(0));
        let counter = called.clone();
        let delivery = fx.delivery(Arc::new(FnConsumer::new(move |frame: LockedFrame| {
            counter.fetch_add(1, Ordering::SeqCst);
            frame.release()
        })));

        fx.mock.inject_foreign_active_buffer(MemoryHandle(0xdead_beef));
        assert_eq!(delivery.deliver_next().await.unwrap(), DeliveryOutcome::Skipped);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(delivery.stats().skipped, 1);
        assert!(!fx
            .mock
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::LockBuffer { .. })));
    }

    #[tokio::test]
    async fn test_dropped_frame_is_unlocked_once() {
        let fx = fixture(2);
        let delivery = fx.delivery(Arc::new(FnConsumer::new(|frame: LockedFrame| {
            drop(frame);
            Ok(())
        })));

        fx.capture();
        delivery.deliver_next().await.unwrap();
        let unlocks = fx
            .mock
            .calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::UnlockBuffer { .. }))
            .count();
        assert_eq!(unlocks, 1);
        assert_eq!(fx.mock.locked_buffers(), 0);
    }

    #[tokio::test]
    async fn test_consumer_error_still_unlocks() {
        let fx = fixture(2);
        let delivery = fx.delivery(Arc::new(FnConsumer::new(|frame: LockedFrame| {
            frame.release()?;
            Err(CaptureError::InvalidState("disk full".into()))
        })));

        fx.capture();
        assert!(delivery.deliver_next().await.is_err());
        assert_eq!(fx.mock.locked_buffers(), 0);
        assert_eq!(delivery.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_wraparound_detection() {
        let fx = fixture(2);
        let wraps = Arc::new(Mutex::new(Vec::new()));
        let sink = wraps.clone();
        let delivery = fx.delivery(Arc::new(FnConsumer::new(move |frame: LockedFrame| {
            sink.lock().push(frame.wrapped());
            frame.release()
        })));

        for _ in 0..5 {
            fx.capture();
            delivery.deliver_next().await.unwrap();
        }
        // Indices 0,1,0,1,0.
        assert_eq!(*wraps.lock(), vec![false, false, true, false, true]);
        assert_eq!(delivery.stats().wraparounds, 2);
    }

    #[tokio::test]
    async fn test_channel_consumer_waits_for_release() {
        let fx = fixture(3);
        let (consumer, mut rx) = ChannelConsumer::new(4);
        let delivery = Arc::new(fx.delivery(Arc::new(consumer)));

        fx.capture();
        let task = {
            let delivery = delivery.clone();
            tokio::spawn(async move { delivery.deliver_next().await })
        };

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(fx.mock.locked_buffers(), 1);
        assert!(!task.is_finished());

        frame.release().unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(fx.mock.locked_buffers(), 0);
    }

    #[tokio::test]
    async fn test_channel_consumer_drops_when_closed() {
        let fx = fixture(2);
        let (consumer, rx) = ChannelConsumer::new(1);
        drop(rx);
        let consumer = Arc::new(consumer);
        let delivery = fx.delivery(consumer.clone());

        fx.capture();
        delivery.deliver_next().await.unwrap();
        assert_eq!(consumer.dropped(), 1);
        assert_eq!(fx.mock.locked_buffers(), 0);
    }

    #[tokio::test]
    async fn test_lock_failure_counted() {
        let fx = fixture(1);
        let delivery = fx.delivery(Arc::new(FnConsumer::new(|frame: LockedFrame| frame.release())));
        fx.capture();
        // Hold the only buffer so the delivery lock is refused by the ring.
        fx.ring.lock().lock(fx.device, 0).unwrap();

        let err = delivery.deliver_next().await.unwrap_err();
        assert!(matches!(err, CaptureError::BufferLocked(0)));
        assert_eq!(delivery.stats().lock_failures, 1);
    }
}
