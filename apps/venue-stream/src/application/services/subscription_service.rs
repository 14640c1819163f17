//! Subscription Service
//!
//! Drives the [`SubscriptionRegistry`] over a [`Connection`]: registers the
//! transition, sends the venue's control message, then waits for the ack
//! the dispatcher feeds back into the registry.
//!
//! Operations on one key are serialized with a FIFO lock held for the whole
//! round trip, so the last request issued decides the final state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::application::ports::{
    CodecError, Connection, Reporter, StreamError, SubscriptionCodec, report_latency,
};
use crate::domain::subscription::{
    AckFailure, AckResult, BeginSubscribe, BeginUnsubscribe, ChannelKey, ChannelState,
    ChannelSubscription, SubscriptionOperation, SubscriptionRegistry,
};
use crate::infrastructure::config::{ConnectionSetup, DEFAULT_RESPONSE_CHECK_TIMEOUT};
use crate::infrastructure::metrics;

/// Subscription operation errors. Failures are local to one key.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// No acknowledgment arrived before the deadline.
    #[error("subscription timeout: no {operation} ack for {key} within {timeout:?}")]
    Timeout {
        /// Key being changed.
        key: ChannelKey,
        /// Operation that timed out.
        operation: &'static str,
        /// Ack deadline.
        timeout: Duration,
    },

    /// The venue rejected the request.
    #[error("{operation} of {key} rejected: {reason}")]
    Rejected {
        /// Key being changed.
        key: ChannelKey,
        /// Operation that was rejected.
        operation: &'static str,
        /// Venue-supplied reason.
        reason: String,
    },

    /// Unsubscribe of a key that is not registered.
    #[error("not subscribed: {0}")]
    NotSubscribed(ChannelKey),

    /// Another transition for the key is awaiting its ack outside this service.
    #[error("{key} is {state}")]
    InFlight {
        /// Key being changed.
        key: ChannelKey,
        /// Current in-flight state.
        state: &'static str,
    },

    /// The link dropped while waiting for the ack.
    #[error("connection lost while changing {0}")]
    ConnectionLost(ChannelKey),

    /// The control message could not be sent.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The control message could not be built.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Outcome of a successful subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The venue acknowledged the subscription.
    Subscribed,
    /// The key was already subscribed; nothing was sent.
    AlreadySubscribed,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Subscription orchestration for one connection.
pub struct SubscriptionService {
    connection: Arc<dyn Connection>,
    codec: Arc<dyn SubscriptionCodec>,
    registry: Arc<SubscriptionRegistry>,
    reporter: Arc<dyn Reporter>,
    ack_timeout: Duration,
    key_locks: Mutex<HashMap<ChannelKey, KeyLock>>,
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("ack_timeout", &self.ack_timeout)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Create a service using the setup's ack deadline and reporter.
    #[must_use]
    pub fn new(
        connection: Arc<dyn Connection>,
        codec: Arc<dyn SubscriptionCodec>,
        registry: Arc<SubscriptionRegistry>,
        setup: &ConnectionSetup,
    ) -> Self {
        Self {
            connection,
            codec,
            registry,
            reporter: Arc::clone(&setup.reporter),
            ack_timeout: setup.response_check_timeout,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a service with the default ack deadline and the given reporter.
    #[must_use]
    pub fn with_reporter(
        connection: Arc<dyn Connection>,
        codec: Arc<dyn SubscriptionCodec>,
        registry: Arc<SubscriptionRegistry>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            connection,
            codec,
            registry,
            reporter,
            ack_timeout: DEFAULT_RESPONSE_CHECK_TIMEOUT,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the ack deadline.
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// The registry this service drives.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Ack deadline.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Subscribe to a channel and wait for the venue's ack.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent, is rejected, times
    /// out or the link drops first. The registry entry is reverted in every
    /// error case, and when the returned future is dropped before it
    /// completes.
    pub async fn subscribe(
        &self,
        subscription: ChannelSubscription,
    ) -> Result<SubscribeOutcome, SubscriptionError> {
        let slot = KeySlot::acquire(self, subscription.key());
        let _serialized = slot.serialize().await;
        self.subscribe_locked(subscription).await
    }

    /// Unsubscribe from a channel and wait for the venue's ack.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotSubscribed`] for unknown keys, and the
    /// same errors as [`Self::subscribe`] otherwise. On error the entry
    /// returns to `Subscribed`.
    pub async fn unsubscribe(&self, key: &ChannelKey) -> Result<(), SubscriptionError> {
        let slot = KeySlot::acquire(self, key.clone());
        let _serialized = slot.serialize().await;
        self.unsubscribe_locked(key).await
    }

    /// Re-issue subscriptions after a redial, concurrently.
    pub async fn resubscribe(
        &self,
        subscriptions: Vec<ChannelSubscription>,
    ) -> Vec<(ChannelKey, Result<SubscribeOutcome, SubscriptionError>)> {
        tracing::info!(count = subscriptions.len(), "Restoring subscriptions");

        let attempts = subscriptions.into_iter().map(|subscription| async move {
            let key = subscription.key();
            let result = self.subscribe(subscription).await;
            if let Err(e) = &result {
                tracing::warn!(key = %key, error = %e, "Failed to restore subscription");
            }
            (key, result)
        });
        futures::future::join_all(attempts).await
    }

    async fn subscribe_locked(
        &self,
        subscription: ChannelSubscription,
    ) -> Result<SubscribeOutcome, SubscriptionError> {
        let key = subscription.key();
        let operation = SubscriptionOperation::Subscribe;

        let rx = match self.registry.begin_subscribe(subscription.clone()) {
            BeginSubscribe::Started(rx) => rx,
            BeginSubscribe::AlreadySubscribed => {
                tracing::debug!(key = %key, "Already subscribed");
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            BeginSubscribe::InFlight(state) => return Err(in_flight(key, state)),
        };
        let pending = PendingTransition::new(&self.registry, &key, operation);

        let message = self.codec.subscribe_message(&subscription)?;
        self.round_trip(&key, operation, &message, rx).await?;
        pending.settle();
        tracing::info!(key = %key, "Subscribed");
        Ok(SubscribeOutcome::Subscribed)
    }

    async fn unsubscribe_locked(&self, key: &ChannelKey) -> Result<(), SubscriptionError> {
        let operation = SubscriptionOperation::Unsubscribe;

        let rx = match self.registry.begin_unsubscribe(key) {
            BeginUnsubscribe::Started(rx) => rx,
            BeginUnsubscribe::NotSubscribed => {
                return Err(SubscriptionError::NotSubscribed(key.clone()));
            }
            BeginUnsubscribe::InFlight(state) => return Err(in_flight(key.clone(), state)),
        };
        let pending = PendingTransition::new(&self.registry, key, operation);

        let subscription = self
            .registry
            .get(key)
            .ok_or_else(|| SubscriptionError::NotSubscribed(key.clone()))?;
        let message = self.codec.unsubscribe_message(&subscription)?;
        self.round_trip(key, operation, &message, rx).await?;
        pending.settle();
        tracing::info!(key = %key, "Unsubscribed");
        Ok(())
    }

    /// Send the control message and wait for its ack, reverting on failure.
    async fn round_trip(
        &self,
        key: &ChannelKey,
        operation: SubscriptionOperation,
        message: &serde_json::Value,
        mut rx: oneshot::Receiver<AckResult>,
    ) -> Result<(), SubscriptionError> {
        let started = Instant::now();

        if let Err(e) = self.connection.send_json_message(message).await {
            tracing::warn!(
                key = %key,
                operation = operation.as_str(),
                error = %e,
                "Failed to send subscription request"
            );
            self.registry.abort(key, operation);
            metrics::set_subscriptions(self.registry.stats());
            return Err(e.into());
        }
        metrics::set_subscriptions(self.registry.stats());

        let outcome = match tokio::time::timeout(self.ack_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AckFailure::ConnectionLost),
            Err(_) => {
                if self.registry.expire(key, operation) {
                    tracing::warn!(
                        key = %key,
                        operation = operation.as_str(),
                        timeout_ms = self.ack_timeout.as_millis(),
                        "Subscription ack timed out"
                    );
                    metrics::set_subscriptions(self.registry.stats());
                    return Err(SubscriptionError::Timeout {
                        key: key.clone(),
                        operation: operation.as_str(),
                        timeout: self.ack_timeout,
                    });
                }
                // The ack won the race with the deadline
                rx.try_recv().unwrap_or(Err(AckFailure::ConnectionLost))
            }
        };
        metrics::set_subscriptions(self.registry.stats());

        match outcome {
            Ok(()) => {
                let raw = message.to_string();
                report_latency(
                    self.reporter.as_ref(),
                    operation.as_str(),
                    raw.as_bytes(),
                    started.elapsed(),
                );
                Ok(())
            }
            Err(AckFailure::Rejected(reason)) => {
                tracing::warn!(
                    key = %key,
                    operation = operation.as_str(),
                    reason = %reason,
                    "Subscription rejected"
                );
                Err(SubscriptionError::Rejected {
                    key: key.clone(),
                    operation: operation.as_str(),
                    reason,
                })
            }
            Err(AckFailure::ConnectionLost) => Err(SubscriptionError::ConnectionLost(key.clone())),
            Err(AckFailure::Shutdown) => Err(StreamError::Shutdown.into()),
        }
    }
}

/// A key's entry in the lock table, removed on drop once no other operation
/// holds or awaits it. Runs when the owning future is cancelled too.
struct KeySlot<'a> {
    service: &'a SubscriptionService,
    key: ChannelKey,
    lock: KeyLock,
}

impl<'a> KeySlot<'a> {
    fn acquire(service: &'a SubscriptionService, key: ChannelKey) -> Self {
        let lock = Arc::clone(service.key_locks.lock().entry(key.clone()).or_default());
        Self { service, key, lock }
    }

    async fn serialize(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }
}

impl Drop for KeySlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.service.key_locks.lock();
        // Held only by the table and this slot
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Reverts an in-flight transition unless it was settled.
///
/// Covers every early exit: build failures, send failures and callers that
/// drop the future while it waits for the ack.
struct PendingTransition<'a> {
    registry: &'a SubscriptionRegistry,
    key: &'a ChannelKey,
    operation: SubscriptionOperation,
    settled: bool,
}

impl<'a> PendingTransition<'a> {
    const fn new(
        registry: &'a SubscriptionRegistry,
        key: &'a ChannelKey,
        operation: SubscriptionOperation,
    ) -> Self {
        Self {
            registry,
            key,
            operation,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.registry.abort(self.key, self.operation) {
            tracing::debug!(
                key = %self.key,
                operation = self.operation.as_str(),
                "Reverted unfinished subscription transition"
            );
            metrics::set_subscriptions(self.registry.stats());
        }
    }
}

fn in_flight(key: ChannelKey, state: ChannelState) -> SubscriptionError {
    SubscriptionError::InFlight {
        key,
        state: state.as_str(),
    }
}

// =============================================================================
// Tests
// =============================================================================
