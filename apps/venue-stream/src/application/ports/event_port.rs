//! Event Port (Driven Port)
//!
//! Out-of-band notifications from a connection: lifecycle changes, ping
//! failures and unrecognised frames. Events are diagnostic; a slow or absent
//! listener never blocks the read loop.

use tokio::sync::mpsc;

use crate::domain::envelope::UnhandledMessageWarning;
use crate::domain::subscription::ChannelSubscription;

/// Connection event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The link was dialed.
    Connected {
        /// Endpoint.
        url: String,
    },
    /// The link was shut down locally.
    Disconnected {
        /// Endpoint.
        url: String,
    },
    /// A frame matched no route.
    Unhandled(UnhandledMessageWarning),
    /// A keep-alive ping could not be sent.
    PingFailed {
        /// Failure details.
        error: String,
    },
    /// The link dropped.
    ///
    /// `resubscribe` lists the subscriptions that were active or being
    /// established, for the reconnection policy to re-issue after redial.
    ConnectionLost {
        /// Failure details.
        reason: String,
        /// Subscriptions to restore.
        resubscribe: Vec<ChannelSubscription>,
    },
}

/// Sending half of the event channel. Cloneable; a sink without a channel
/// discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl EventSink {
    /// Create a sink and its receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit without waiting; the event is dropped if the channel is full.
    pub fn emit(&self, event: StreamEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            tracing::debug!(event = ?event, "Event channel full, dropping event");
        }
    }

    /// Emit, waiting for channel capacity. Used for events that must not be lost.
    pub async fn emit_reliable(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.emit(StreamEvent::Connected {
            url: "ws://venue".into(),
        });
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Connected {
                url: "ws://venue".into()
            })
        );
    }

    #[tokio::test]
    async fn emit_drops_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(StreamEvent::PingFailed { error: "a".into() });
        sink.emit(StreamEvent::PingFailed { error: "b".into() });

        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::PingFailed { error: "a".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_sink_discards() {
        EventSink::disabled().emit(StreamEvent::Disconnected { url: String::new() });
    }
}
