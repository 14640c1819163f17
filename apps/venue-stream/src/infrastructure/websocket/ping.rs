//! Ping Scheduler
//!
//! Keeps a dialed link alive by sending the configured ping every
//! `delay`. The handler can be replaced at any time; the scheduler restarts
//! its interval on the next change. A failed ping is reported and the
//! schedule continues; liveness decisions belong to the reader.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use crate::application::ports::PingHandler;
use crate::application::ports::{EventSink, Reporter, StreamError, StreamEvent, report_latency};
use crate::domain::frame::FrameType;
use crate::infrastructure::metrics;

/// Write access to a connection's send path.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame through the serialized send path.
    async fn send_frame(&self, frame_type: FrameType, raw: Vec<u8>) -> Result<(), StreamError>;
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug, Default)]
struct TrackerInner {
    outstanding: Option<(Instant, Vec<u8>)>,
    last_pong: Option<Instant>,
}

/// Round-trip tracking for native pings.
///
/// Shared between the scheduler (records sends) and the dispatcher
/// (records pongs).
#[derive(Default)]
pub struct PingTracker {
    inner: Mutex<TrackerInner>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl std::fmt::Debug for PingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingTracker")
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl PingTracker {
    /// Create a tracker that reports round-trips as `ping` latency.
    #[must_use]
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            reporter: Some(reporter),
        }
    }

    /// Record that a ping with `payload` was sent.
    pub fn record_ping_sent(&self, payload: &[u8]) {
        self.inner.lock().outstanding = Some((Instant::now(), payload.to_vec()));
    }

    /// Record a pong. Returns the round-trip time if it answers the
    /// outstanding ping.
    pub fn record_pong(&self, payload: &[u8]) -> Option<Duration> {
        let now = Instant::now();
        let rtt = {
            let mut inner = self.inner.lock();
            inner.last_pong = Some(now);
            match inner.outstanding.take() {
                Some((sent, ref sent_payload)) if sent_payload.as_slice() == payload => {
                    Some(now.saturating_duration_since(sent))
                }
                other => {
                    inner.outstanding = other;
                    None
                }
            }
        };

        if let (Some(rtt), Some(reporter)) = (rtt, &self.reporter) {
            report_latency(reporter.as_ref(), "ping", payload, rtt);
        }
        rtt
    }

    /// Check if a native ping is awaiting its pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.inner.lock().outstanding.is_some()
    }

    /// Time since the last pong, if one was seen.
    #[must_use]
    pub fn time_since_pong(&self) -> Option<Duration> {
        self.inner.lock().last_pong.map(|t| t.elapsed())
    }

    /// Reset state for a new session.
    pub fn reset(&self) {
        *self.inner.lock() = TrackerInner::default();
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Periodic ping task for one dialed session.
pub struct PingScheduler {
    handler: watch::Receiver<PingHandler>,
    sink: Arc<dyn FrameSink>,
    tracker: Arc<PingTracker>,
    events: EventSink,
    cancel: CancellationToken,
}

impl PingScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        handler: watch::Receiver<PingHandler>,
        sink: Arc<dyn FrameSink>,
        tracker: Arc<PingTracker>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler,
            sink,
            tracker,
            events,
            cancel,
        }
    }

    /// Run until the session is cancelled or the handler channel closes.
    pub async fn run(mut self) {
        loop {
            let handler = self.handler.borrow_and_update().clone();

            if !handler.is_enabled() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    changed = self.handler.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tracing::debug!(
                delay_ms = handler.delay.as_millis(),
                native = handler.native,
                "Ping schedule started"
            );

            let mut interval =
                tokio::time::interval_at(Instant::now() + handler.delay, handler.delay);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        tracing::debug!("Ping scheduler cancelled");
                        return;
                    }
                    changed = self.handler.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    _ = interval.tick() => self.send_ping(&handler).await,
                }
            }
        }
    }

    async fn send_ping(&self, handler: &PingHandler) {
        let frame_type = if handler.native {
            self.tracker.record_ping_sent(&handler.message);
            FrameType::Ping
        } else {
            handler.message_type
        };

        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::debug!("Ping send abandoned on cancellation");
                return;
            }
            sent = self.sink.send_frame(frame_type, handler.message.clone()) => sent,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, frame_type = %frame_type, "Failed to send ping");
            metrics::record_ping_failure();
            self.events.emit(StreamEvent::PingFailed {
                error: e.to_string(),
            });
        }
    }
}
