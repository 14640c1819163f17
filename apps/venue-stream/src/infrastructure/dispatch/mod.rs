//! Inbound Frame Dispatcher
//!
//! Owns a connection's read loop and routes every frame to exactly one
//! destination:
//!
//! 1. Ping/pong control frames: pongs feed the [`PingTracker`]
//! 2. Replies to outstanding requests: the [`MessageCorrelator`]
//! 3. Subscription acks: the [`SubscriptionRegistry`]
//! 4. Market data: the consumer registered for the payload kind
//! 5. Anything else: one [`UnhandledMessageWarning`]

use std::sync::Arc;

use crate::application::ports::{
    Connection, ConsumerRegistry, Decoded, EventSink, FrameClassifier, StreamError, StreamEvent,
};
use crate::domain::envelope::UnhandledMessageWarning;
use crate::domain::frame::{Frame, FrameType};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::correlation::{FailReason, MessageCorrelator};
use crate::infrastructure::metrics;
use crate::infrastructure::websocket::{PingTracker, WebSocketConnection};

/// Why the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchExit {
    /// The link dropped; pending work has been failed.
    ConnectionLost(String),
    /// The connection was shut down locally.
    Shutdown,
}

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Control,
    Reply,
    Ack,
    Consumer,
    Unhandled,
}

/// Read loop for one connection.
pub struct Dispatcher {
    connection: Arc<dyn Connection>,
    correlator: Arc<MessageCorrelator>,
    ping_tracker: Arc<PingTracker>,
    classifier: Arc<dyn FrameClassifier>,
    registry: Arc<SubscriptionRegistry>,
    consumers: Arc<ConsumerRegistry>,
    events: EventSink,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("url", &self.connection.url())
            .field("pending_requests", &self.correlator.len())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher from its parts.
    #[must_use]
    pub fn new(
        connection: Arc<dyn Connection>,
        correlator: Arc<MessageCorrelator>,
        ping_tracker: Arc<PingTracker>,
        classifier: Arc<dyn FrameClassifier>,
        registry: Arc<SubscriptionRegistry>,
        consumers: Arc<ConsumerRegistry>,
        events: EventSink,
    ) -> Self {
        Self {
            connection,
            correlator,
            ping_tracker,
            classifier,
            registry,
            consumers,
            events,
        }
    }

    /// Create a dispatcher sharing the correlation table, ping tracker and
    /// event sink of a [`WebSocketConnection`].
    #[must_use]
    pub fn for_websocket(
        connection: &Arc<WebSocketConnection>,
        classifier: Arc<dyn FrameClassifier>,
        registry: Arc<SubscriptionRegistry>,
        consumers: Arc<ConsumerRegistry>,
    ) -> Self {
        Self::new(
            Arc::clone(connection) as Arc<dyn Connection>,
            connection.correlator(),
            connection.ping_tracker(),
            classifier,
            registry,
            consumers,
            connection.event_sink(),
        )
    }

    /// Drain frames until the link drops or is shut down.
    pub async fn run(self) -> DispatchExit {
        tracing::debug!(url = %self.connection.url(), "Dispatcher started");

        loop {
            match self.connection.read_message().await {
                Ok(frame) => {
                    self.dispatch(&frame);
                }
                Err(StreamError::Shutdown | StreamError::NotConnected) => {
                    self.handle_shutdown();
                    return DispatchExit::Shutdown;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.handle_connection_lost(&reason).await;
                    return DispatchExit::ConnectionLost(reason);
                }
            }
        }
    }

    fn dispatch(&self, frame: &Frame) -> Route {
        if frame.frame_type.is_control() {
            if frame.frame_type == FrameType::Pong {
                self.ping_tracker.record_pong(&frame.raw);
            }
            return Route::Control;
        }

        if let Some(id) = self.classifier.correlation_id(frame) {
            if self.correlator.deliver(&id, frame.raw.clone()) {
                return Route::Reply;
            }
            tracing::debug!(id = %id, "Reply for unknown or expired request");
        }

        match self.classifier.decode(frame) {
            Some(Decoded::Ack(ack)) => {
                if !self.registry.acknowledge(&ack) {
                    tracing::debug!(key = %ack.key, "Ignoring stale subscription ack");
                }
                metrics::set_subscriptions(self.registry.stats());
                Route::Ack
            }
            Some(Decoded::Envelope(envelope)) => match self.consumers.dispatch(envelope) {
                Ok(()) => Route::Consumer,
                Err(envelope) => {
                    tracing::debug!(kind = %envelope.kind(), "No consumer registered");
                    self.unhandled(frame);
                    Route::Unhandled
                }
            },
            None => {
                self.unhandled(frame);
                Route::Unhandled
            }
        }
    }

    fn unhandled(&self, frame: &Frame) {
        let warning = UnhandledMessageWarning {
            message: frame.to_text_lossy(),
        };
        tracing::warn!(
            url = %self.connection.url(),
            frame_type = frame.frame_type.as_str(),
            message = %warning.message,
            "Unhandled message"
        );
        metrics::record_unhandled_message();
        self.events.emit(StreamEvent::Unhandled(warning));
    }

    fn handle_shutdown(&self) {
        let dropped = self.registry.shutdown();
        metrics::set_subscriptions(self.registry.stats());
        tracing::debug!(
            url = %self.connection.url(),
            dropped_subscriptions = dropped.len(),
            "Dispatcher stopped"
        );
    }

    async fn handle_connection_lost(&self, reason: &str) {
        let failed = self
            .correlator
            .fail_all(&FailReason::ConnectionLost(reason.to_string()));
        let resubscribe = self.registry.connection_lost();
        metrics::set_subscriptions(self.registry.stats());

        tracing::warn!(
            url = %self.connection.url(),
            reason,
            failed_requests = failed,
            resubscribe = resubscribe.len(),
            "Connection lost"
        );

        self.events
            .emit_reliable(StreamEvent::ConnectionLost {
                reason: reason.to_string(),
                resubscribe,
            })
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::application::ports::{
        CorrelationId, Envelope, MockConnection, NoopReporter, PayloadKind,
    };
    use crate::domain::envelope::{AssetType, CurrencyPair};
    use crate::domain::subscription::{
        AckFailure, BeginSubscribe, ChannelState, ChannelSubscription, SubscriptionAck,
    };
    use crate::testing::JsonTestVenue;

    struct Harness {
        correlator: Arc<MessageCorrelator>,
        registry: Arc<SubscriptionRegistry>,
        consumers: Arc<ConsumerRegistry>,
        events: tokio::sync::mpsc::Receiver<StreamEvent>,
        dispatcher: Dispatcher,
    }

    fn harness(frames: Vec<Result<Frame, StreamError>>) -> Harness {
        let mut frames = frames.into_iter();
        let mut connection = MockConnection::new();
        connection
            .expect_read_message()
            .returning(move || frames.next().unwrap_or(Err(StreamError::Shutdown)));
        connection
            .expect_url()
            .returning(|| "ws://venue.test".to_string());

        let correlator = Arc::new(MessageCorrelator::new(Duration::from_secs(2)));
        let registry = Arc::new(SubscriptionRegistry::new());
        let consumers = Arc::new(ConsumerRegistry::new());
        let (sink, events) = EventSink::channel(16);

        let dispatcher = Dispatcher::new(
            Arc::new(connection),
            Arc::clone(&correlator),
            Arc::new(PingTracker::new(Arc::new(NoopReporter))),
            Arc::new(JsonTestVenue::new()),
            Arc::clone(&registry),
            Arc::clone(&consumers),
            sink,
        );

        Harness {
            correlator,
            registry,
            consumers,
            events,
            dispatcher,
        }
    }

    fn trades() -> ChannelSubscription {
        ChannelSubscription::new("trades")
            .with_pair(CurrencyPair::new("BTC", "USD"))
            .with_asset(AssetType::Spot)
    }

    #[tokio::test]
    async fn unrecognised_frame_warns_once_without_dispatch() {
        let mut h = harness(vec![Ok(Frame::text(r#"{"hello":"world"}"#))]);
        let calls = Arc::new(AtomicUsize::new(0));
        for kind in [PayloadKind::Funding, PayloadKind::Kline, PayloadKind::PositionUpdated] {
            let calls = Arc::clone(&calls);
            h.consumers.on(kind, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(h.dispatcher.run().await, DispatchExit::Shutdown);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let event = h.events.try_recv().unwrap();
        assert_eq!(
            event,
            StreamEvent::Unhandled(UnhandledMessageWarning {
                message: r#"{"hello":"world"}"#.to_string()
            })
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_goes_to_correlator() {
        let h = harness(vec![]);
        let pending = h.correlator.register(CorrelationId::Numeric(42)).unwrap();

        let reply = Frame::text(r#"{"id":42,"result":"ok"}"#);
        assert_eq!(h.dispatcher.dispatch(&reply), Route::Reply);
        assert_eq!(pending.wait().await.unwrap(), reply.raw);
    }

    #[tokio::test]
    async fn reply_without_pending_entry_is_unhandled() {
        let mut h = harness(vec![]);
        let frame = Frame::text(r#"{"id":7,"result":"late"}"#);
        assert_eq!(h.dispatcher.dispatch(&frame), Route::Unhandled);
        assert!(matches!(h.events.try_recv(), Ok(StreamEvent::Unhandled(_))));
    }

    #[tokio::test]
    async fn ack_advances_registry() {
        let h = harness(vec![]);
        let BeginSubscribe::Started(rx) = h.registry.begin_subscribe(trades()) else {
            panic!("expected a new subscription");
        };

        let ack = Frame::text(
            r#"{"event":"subscribed","channel":"trades","pair":"BTC-USD","asset":"spot"}"#,
        );
        assert_eq!(h.dispatcher.dispatch(&ack), Route::Ack);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(h.registry.state(&trades().key()), ChannelState::Subscribed);
    }

    #[tokio::test]
    async fn envelope_dispatched_to_single_consumer() {
        let h = harness(vec![]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        h.consumers.on(PayloadKind::Custom("ticker".into()), move |env| {
            assert!(matches!(env, Envelope::Custom { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let frame = Frame::text(r#"{"type":"ticker","price":"101.5"}"#);
        assert_eq!(h.dispatcher.dispatch(&frame), Route::Consumer);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn envelope_without_consumer_is_unhandled() {
        let mut h = harness(vec![]);
        let frame = Frame::text(r#"{"type":"ticker","price":"101.5"}"#);
        assert_eq!(h.dispatcher.dispatch(&frame), Route::Unhandled);
        assert!(matches!(h.events.try_recv(), Ok(StreamEvent::Unhandled(_))));
    }

    #[tokio::test]
    async fn control_frames_are_not_forwarded() {
        let mut h = harness(vec![]);
        assert_eq!(
            h.dispatcher.dispatch(&Frame::new(FrameType::Ping, vec![])),
            Route::Control
        );
        assert_eq!(
            h.dispatcher.dispatch(&Frame::new(FrameType::Pong, vec![1])),
            Route::Control
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_lost_fails_pending_and_reports_resubscribe() {
        let mut h = harness(vec![Err(StreamError::ConnectionLost("reset".into()))]);

        let pending = h.correlator.register(CorrelationId::Numeric(1)).unwrap();
        let BeginSubscribe::Started(sub_rx) = h.registry.begin_subscribe(trades()) else {
            panic!("expected a new subscription");
        };

        let exit = h.dispatcher.run().await;
        assert!(matches!(exit, DispatchExit::ConnectionLost(_)));

        assert!(matches!(
            pending.wait().await,
            Err(StreamError::ConnectionLost(_))
        ));
        assert!(sub_rx.await.unwrap().is_err());
        assert!(h.registry.is_empty());

        match h.events.recv().await.unwrap() {
            StreamEvent::ConnectionLost { resubscribe, .. } => {
                assert_eq!(resubscribe, vec![trades()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_clears_registry_and_fails_waiters() {
        let h = harness(vec![]);
        let BeginSubscribe::Started(_acked) = h.registry.begin_subscribe(trades()) else {
            panic!("expected a new subscription");
        };
        assert!(h.registry.acknowledge(&SubscriptionAck::subscribed(trades().key())));
        let candles = ChannelSubscription::new("candles");
        let BeginSubscribe::Started(waiter) = h.registry.begin_subscribe(candles) else {
            panic!("expected a new subscription");
        };

        assert_eq!(h.dispatcher.run().await, DispatchExit::Shutdown);

        assert!(h.registry.is_empty());
        assert_eq!(waiter.await.unwrap(), Err(AckFailure::Shutdown));
    }

    #[tokio::test]
    async fn stale_ack_is_ignored() {
        let h = harness(vec![]);
        let ack = SubscriptionAck::subscribed(trades().key());
        assert!(!h.registry.acknowledge(&ack));

        let frame = Frame::text(
            r#"{"event":"subscribed","channel":"trades","pair":"BTC-USD","asset":"spot"}"#,
        );
        assert_eq!(h.dispatcher.dispatch(&frame), Route::Ack);
        assert!(h.registry.is_empty());
    }
}
