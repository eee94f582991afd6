//! End-to-end acquisition against the mock gateway.
//!
//! Frames flow device -> ring -> event loop -> delivery -> channel consumer,
//! and the call journal is used to check lock/unlock discipline.

use seqcam_core::{AcquisitionMode, EventId, SequenceNumber};
use seqcam_driver::{CaptureSettings, ChannelConsumer, LockedFrame, SequenceCamera};
use seqcam_driver_mock::{
    read_frame_stamp, DriverCall, MockGateway, MockMode, ScriptedWait, TimingConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn mock_640x480() -> Arc<MockGateway> {
    Arc::new(
        MockGateway::builder()
            .sensor_size(1280, 1024)
            .aoi(640, 480)
            .arbitrary_aoi(false)
            .build(),
    )
}

async fn start(
    mock: &Arc<MockGateway>,
    settings: CaptureSettings,
) -> (SequenceCamera, mpsc::Receiver<LockedFrame>) {
    let (consumer, rx) = ChannelConsumer::new(8);
    let mut camera = SequenceCamera::new(mock.clone(), settings);
    camera.start(Arc::new(consumer)).await.unwrap();
    (camera, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<LockedFrame>) -> LockedFrame {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("frame channel closed")
}

fn lock_unlock_calls(mock: &MockGateway) -> Vec<DriverCall> {
    mock.calls()
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                DriverCall::LockBuffer { .. } | DriverCall::UnlockBuffer { .. }
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_buffers_five_frames() {
    let mock = mock_640x480();
    let (mut camera, mut rx) = start(&mock, CaptureSettings::default()).await;
    assert_eq!(camera.geometry().map(|g| (g.width, g.height)), Some((640, 480)));

    mock.trigger_n(EventId::FRAME, 5);

    let mut indices = Vec::new();
    for expected_number in 1..=5u64 {
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.len(), 640 * 480);
        assert_eq!(frame.frame_number(), expected_number);
        assert_eq!(read_frame_stamp(frame.pixels()), Some(expected_number));
        indices.push(frame.index());
        frame.release().unwrap();
    }
    assert_eq!(indices, vec![0, 1, 2, 0, 1]);

    // Every lock is followed by the unlock of the same slot before the next lock.
    let calls = lock_unlock_calls(&mock);
    assert_eq!(calls.len(), 10);
    let memory_of: Vec<_> = {
        let ring = camera.ring().lock();
        ring.buffers().iter().map(|b| b.memory).collect()
    };
    for (cycle, pair) in calls.chunks(2).enumerate() {
        let index = indices[cycle];
        let seq = SequenceNumber(index as u32 + 1);
        let memory = memory_of[index];
        assert_eq!(pair[0], DriverCall::LockBuffer { seq, memory });
        assert_eq!(pair[1], DriverCall::UnlockBuffer { seq, memory });
    }

    let stats = camera.delivery_stats();
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.wraparounds, 1);
    assert_eq!(stats.skipped, 0);

    let report = camera.teardown().await;
    assert!(report.is_clean(), "{report}");
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeouts_then_one_firing_delivers_once() {
    let mock = mock_640x480();
    let settings = CaptureSettings {
        frame_timeout_ms: 20,
        ..Default::default()
    };
    let (mut camera, mut rx) = start(&mock, settings).await;
    // Scripted after start so the firing captures into a running sequence.
    mock.script_waits(
        EventId::FRAME,
        [
            ScriptedWait::Timeout,
            ScriptedWait::Timeout,
            ScriptedWait::Timeout,
            ScriptedWait::Timeout,
            ScriptedWait::Fire,
        ],
    );

    let frame = next_frame(&mut rx).await;
    frame.release().unwrap();

    // Nothing else arrives, yet the loop is still armed.
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());
    let stats = camera.event_stats(EventId::FRAME).unwrap();
    assert_eq!(stats.fired, 1);
    assert!(stats.timeouts >= 4);

    mock.trigger(EventId::FRAME);
    next_frame(&mut rx).await.release().unwrap();
    assert_eq!(camera.delivery_stats().delivered, 2);

    assert!(camera.teardown().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_realistic_mode_streams_until_teardown() {
    let mock = Arc::new(
        MockGateway::builder()
            .aoi(128, 64)
            .arbitrary_aoi(false)
            .mode(MockMode::Realistic)
            .timing_config(TimingConfig::with_fps(200.0))
            .build(),
    );
    let settings = CaptureSettings {
        buffer_count: 4,
        bits_per_pixel: 16,
        ..Default::default()
    };
    let (mut camera, mut rx) = start(&mock, settings).await;

    let mut last_number = 0;
    for _ in 0..10 {
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.len(), 128 * 64 * 2);
        assert!(frame.frame_number() > last_number);
        last_number = frame.frame_number();
        frame.release().unwrap();
    }

    let report = camera.teardown().await;
    assert!(report.is_clean(), "{report}");
    assert!(!mock.is_acquiring());
    assert_eq!(mock.allocated_buffers(), 0);
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_shot_delivers_one_frame() {
    let mock = mock_640x480();
    let settings = CaptureSettings {
        mode: AcquisitionMode::SingleShot,
        frame_timeout_ms: 20,
        ..Default::default()
    };
    let (mut camera, mut rx) = start(&mock, settings).await;

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame.index(), 0);
    frame.release().unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());

    assert!(camera.teardown().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresolved_completion_is_skipped_and_loop_continues() {
    let mock = mock_640x480();
    let (mut camera, mut rx) = start(&mock, CaptureSettings::default()).await;

    mock.inject_foreign_active_buffer(seqcam_core::MemoryHandle(0x0bad));
    mock.trigger(EventId::FRAME);
    // The foreign handle is consumed by the first delivery; the next one is real.
    mock.trigger(EventId::FRAME);

    let frame = next_frame(&mut rx).await;
    frame.release().unwrap();

    let stats = camera.delivery_stats();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.delivered, 1);
    assert!(camera.teardown().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_dropped_by_receiver_are_unlocked() {
    let mock = mock_640x480();
    let (mut camera, rx) = start(&mock, CaptureSettings::default()).await;
    drop(rx);

    mock.trigger_n(EventId::FRAME, 3);
    for _ in 0..200 {
        if camera.delivery_stats().delivered == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(camera.delivery_stats().delivered, 3);
    assert!(camera.teardown().await.is_clean());

    let unlocks = lock_unlock_calls(&mock)
        .iter()
        .filter(|c| matches!(c, DriverCall::UnlockBuffer { .. }))
        .count();
    assert_eq!(unlocks, 3);
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}
