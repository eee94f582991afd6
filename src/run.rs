//! Capture a fixed number of frames from the simulated camera.

use crate::config::SeqcamConfig;
use anyhow::{Context, Result};
use seqcam_core::{CaptureStatus, EventId};
use seqcam_driver::{ChannelConsumer, DeliveryStats, SequenceCamera, TeardownReport};
use seqcam_driver_mock::{read_frame_stamp, MockGateway, MockMode, TimingConfig};
use std::sync::Arc;
use std::time::Duration;

/// Simulated camera and how long to run it.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Give up when no frame arrives within this long.
    pub frame_wait: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            frames: 10,
            width: 640,
            height: 480,
            fps: 30.0,
            frame_wait: Duration::from_secs(5),
        }
    }
}

/// One delivered frame, as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub frame_number: u64,
    pub index: usize,
    pub sequence: u32,
    pub bytes: usize,
    /// Sensor frame counter embedded in the pixels
    pub stamp: Option<u64>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub frames: Vec<FrameSummary>,
    pub delivery: DeliveryStats,
    pub status: Option<CaptureStatus>,
    pub teardown: TeardownReport,
}

/// Start a session on a free-running mock camera, take `frames` frames and
/// tear down. `on_frame` sees each frame before it is released.
///
/// Stops early on ctrl-c. Teardown always runs once startup succeeded.
pub async fn run_frames(
    config: &SeqcamConfig,
    options: &RunOptions,
    mut on_frame: impl FnMut(&FrameSummary),
) -> Result<RunSummary> {
    let mock = Arc::new(
        MockGateway::builder()
            .aoi(options.width, options.height)
            .arbitrary_aoi(false)
            .mode(MockMode::Realistic)
            .timing_config(TimingConfig::with_fps(options.fps))
            .build(),
    );

    let (consumer, mut rx) = ChannelConsumer::new(config.camera.buffer_count);
    let mut camera = SequenceCamera::new(mock.clone(), config.capture_settings());
    camera
        .start(Arc::new(consumer))
        .await
        .context("failed to start acquisition")?;

    let mut frames = Vec::new();
    let mut outcome = Ok(());
    while (frames.len() as u64) < options.frames {
        let received = tokio::select! {
            received = tokio::time::timeout(options.frame_wait, rx.recv()) => received,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                outcome = Err(anyhow::anyhow!(
                    "no frame within {:?} (event {})",
                    options.frame_wait,
                    EventId::FRAME
                ));
                break;
            }
        };

        let summary = FrameSummary {
            frame_number: frame.frame_number(),
            index: frame.index(),
            sequence: frame.sequence().0,
            bytes: frame.len(),
            stamp: read_frame_stamp(frame.pixels()),
        };
        on_frame(&summary);
        frames.push(summary);
        if let Err(e) = frame.release() {
            tracing::warn!(error = %e, "frame release failed");
        }
    }

    let status = camera.capture_status().ok();
    // Frames still queued are unlocked when the receiver drops, which lets an
    // in-flight delivery finish before teardown joins it.
    drop(rx);
    let teardown = camera.teardown().await;
    outcome?;

    Ok(RunSummary {
        frames,
        delivery: camera.delivery_stats(),
        status,
        teardown,
    })
}
