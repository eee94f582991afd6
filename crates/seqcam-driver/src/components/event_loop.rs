//! Event subscription and wait/dispatch loop.
//!
//! Each subscribed event is driven by its own tokio task:
//!
//! ```text
//! Disabled ─subscribe─► Enabled ─► Armed ─fired─► Fired ─┐
//!    ▲                               ▲                   │
//!    │                               └──── re-arm ◄──────┘
//!    └──────────────── unsubscribe ──────────────────────
//! ```
//!
//! The driver wait blocks, so it runs on the blocking pool. Whatever the wait
//! returns (fired, timed out, driver error) and whatever the callback does
//! (returns an error, panics), the task re-arms until unsubscribed. The one
//! exception is a wait rejected because the device handle is no longer valid:
//! the task then ends on its own and the event reads as `Disabled`.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use seqcam_core::{
    CaptureError, CaptureResult, DeviceHandle, DriverGateway, EventId, WaitOutcome,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default per-wait timeout.
pub const DEFAULT_WAIT_TIMEOUT_MS: u32 = 5000;

/// Pause before re-arming after a driver error, so a dead link does not spin.
const ERROR_REARM_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked once per firing.
pub type EventCallback = Arc<dyn Fn() -> BoxFuture<'static, CaptureResult<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Disabled,
    Enabled,
    Armed,
    Fired,
}

/// Per-event counters, kept after unsubscribe.
#[derive(Debug, Default)]
pub struct EventStats {
    fired: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    callback_failures: AtomicU64,
}

impl EventStats {
    pub fn snapshot(&self) -> EventStatsSnapshot {
        EventStatsSnapshot {
            fired: self.fired.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStatsSnapshot {
    pub fired: u64,
    pub timeouts: u64,
    /// Driver errors returned by the wait itself.
    pub errors: u64,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: u64,
}

struct Subscription {
    stop: watch::Sender<bool>,
    state: Arc<Mutex<EventState>>,
    task: JoinHandle<()>,
}

/// Drives perpetual waits on the events of one open device.
pub struct EventLoop {
    gateway: Arc<dyn DriverGateway>,
    device: DeviceHandle,
    rearm_delay: Duration,
    subscriptions: Mutex<HashMap<EventId, Subscription>>,
    stats: Mutex<HashMap<EventId, Arc<EventStats>>>,
}

impl EventLoop {
    pub fn new(gateway: Arc<dyn DriverGateway>, device: DeviceHandle) -> Self {
        Self {
            gateway,
            device,
            rearm_delay: Duration::ZERO,
            subscriptions: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Pause between a completed wait and the next one.
    pub fn with_rearm_delay(mut self, delay: Duration) -> Self {
        self.rearm_delay = delay;
        self
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Enable `event` with the driver and start waiting on it.
    ///
    /// Returns as soon as the wait task is spawned. Must be called from within
    /// a tokio runtime.
    pub fn subscribe(
        &self,
        event: EventId,
        timeout_ms: u32,
        on_fire: EventCallback,
    ) -> CaptureResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CaptureError::InvalidState(format!("no tokio runtime: {e}")))?;

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(&event) {
            return Err(CaptureError::AlreadySubscribed(event));
        }

        self.gateway.enable_event(self.device, event)?;

        let state = Arc::new(Mutex::new(EventState::Enabled));
        let stats = Arc::new(EventStats::default());
        self.stats.lock().insert(event, stats.clone());
        let (stop, stop_rx) = watch::channel(false);

        let task = runtime.spawn(
            WaitTask {
                gateway: self.gateway.clone(),
                device: self.device,
                event,
                timeout_ms,
                rearm_delay: self.rearm_delay,
                on_fire,
                state: state.clone(),
                stats,
                stop: stop_rx,
            }
            .run(),
        );

        subscriptions.insert(event, Subscription { stop, state, task });
        tracing::debug!(event = %event, timeout_ms, "event subscribed");
        Ok(())
    }

    /// Stop re-arming, disable `event` with the driver, and wait for the
    /// in-flight wait and dispatch to finish.
    ///
    /// Unsubscribing an event that is not subscribed is a no-op.
    pub async fn unsubscribe(&self, event: EventId) -> CaptureResult<()> {
        let Some(subscription) = self.subscriptions.lock().remove(&event) else {
            return Ok(());
        };
        if subscription.task.is_finished() {
            // Ended on an invalid device handle; nothing left to disable.
            *subscription.state.lock() = EventState::Disabled;
            tracing::debug!(event = %event, "event task already ended");
            return Ok(());
        }
        let _ = subscription.stop.send(true);

        // Disabling wakes a wait blocked in the driver.
        let disabled = self.gateway.disable_event(self.device, event);
        if let Err(e) = &disabled {
            tracing::warn!(event = %event, error = %e, "disable event failed; waiting for wait timeout");
        }

        if let Err(e) = subscription.task.await {
            tracing::error!(event = %event, error = %e, "event task ended abnormally");
        }
        *subscription.state.lock() = EventState::Disabled;
        tracing::debug!(event = %event, "event unsubscribed");
        disabled.map_err(CaptureError::from)
    }

    /// Unsubscribe every event. One result per event, in event id order.
    pub async fn unsubscribe_all(&self) -> Vec<(EventId, CaptureResult<()>)> {
        let mut results = Vec::new();
        for event in self.subscribed() {
            results.push((event, self.unsubscribe(event).await));
        }
        results
    }

    /// Subscribed events in id order.
    pub fn subscribed(&self) -> Vec<EventId> {
        let mut events: Vec<_> = self.subscriptions.lock().keys().copied().collect();
        events.sort();
        events
    }

    /// Subscribed and still waiting.
    pub fn is_subscribed(&self, event: EventId) -> bool {
        self.subscriptions
            .lock()
            .get(&event)
            .is_some_and(|s| !s.task.is_finished())
    }

    pub fn state(&self, event: EventId) -> EventState {
        self.subscriptions
            .lock()
            .get(&event)
            .map(|s| *s.state.lock())
            .unwrap_or(EventState::Disabled)
    }

    pub fn stats(&self, event: EventId) -> Option<EventStatsSnapshot> {
        self.stats.lock().get(&event).map(|s| s.snapshot())
    }

    /// Counters of every event ever subscribed on this loop.
    pub fn all_stats(&self) -> HashMap<EventId, EventStatsSnapshot> {
        self.stats
            .lock()
            .iter()
            .map(|(event, stats)| (*event, stats.snapshot()))
            .collect()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let subscriptions = self.subscriptions.get_mut();
        if !subscriptions.is_empty() {
            tracing::warn!(
                events = subscriptions.len(),
                "event loop dropped with active subscriptions; stopping without disabling"
            );
        }
        for subscription in subscriptions.values() {
            let _ = subscription.stop.send(true);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("device", &self.device)
            .field("rearm_delay", &self.rearm_delay)
            .field("subscribed", &self.subscribed())
            .finish()
    }
}

struct WaitTask {
    gateway: Arc<dyn DriverGateway>,
    device: DeviceHandle,
    event: EventId,
    timeout_ms: u32,
    rearm_delay: Duration,
    on_fire: EventCallback,
    state: Arc<Mutex<EventState>>,
    stats: Arc<EventStats>,
    stop: watch::Receiver<bool>,
}

impl WaitTask {
    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run(mut self) {
        let event = self.event;
        while !self.stopped() {
            *self.state.lock() = EventState::Armed;

            let gateway = self.gateway.clone();
            let (device, timeout_ms) = (self.device, self.timeout_ms);
            let waited =
                tokio::task::spawn_blocking(move || gateway.wait_event(device, event, timeout_ms))
                    .await;

            if self.stopped() {
                break;
            }

            let mut pause = self.rearm_delay;
            match waited {
                Ok(Ok(WaitOutcome::Fired)) => {
                    *self.state.lock() = EventState::Fired;
                    self.stats.fired.fetch_add(1, Ordering::Relaxed);
                    self.dispatch().await;
                }
                Ok(Ok(WaitOutcome::TimedOut)) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(event = %event, "wait timed out; re-arming");
                }
                Ok(Err(e)) if e.is_invalid_device() => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    *self.state.lock() = EventState::Disabled;
                    tracing::error!(event = %event, error = %e, "device handle invalid; event loop ending");
                    return;
                }
                Ok(Err(e)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event = %event, error = %e, "event wait failed; re-arming");
                    pause = pause.max(ERROR_REARM_BACKOFF);
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(event = %event, error = %e, "event wait task failed; re-arming");
                    pause = pause.max(ERROR_REARM_BACKOFF);
                }
            }

            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.stop.changed() => {}
                }
            }
        }
        tracing::trace!(event = %event, "event task exiting");
    }

    async fn dispatch(&self) {
        let on_fire = self.on_fire.clone();
        let outcome = AssertUnwindSafe(async move { on_fire().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.callback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %self.event, error = %e, "event callback failed");
            }
            Err(_) => {
                self.stats.callback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event = %self.event, "event callback panicked");
            }
        }
    }
}

/// Wrap an async closure as an [`EventCallback`].
pub fn callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CaptureResult<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}
