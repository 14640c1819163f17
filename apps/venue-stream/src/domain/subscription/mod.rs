//! Subscription State Machine
//!
//! Domain types for tracking logical channel subscriptions on a single venue
//! connection and their acknowledgment state.
//!
//! # Design
//!
//! The registry tracks:
//! - One entry per [`ChannelKey`]; a key is never registered twice
//! - The lifecycle stage of each entry ([`ChannelState`])
//! - A single-use waiter for the in-flight transition, fulfilled by the venue
//!   acknowledgment, the ack deadline, or connection loss (first one wins)
//!
//! ```text
//! Unknown ──► Subscribing ──► Subscribed ──► Unsubscribing ──► (removed)
//!                 │                ▲               │
//!                 └── timeout ──► (removed)        └── timeout ──► Subscribed
//! ```
//!
//! State only changes through the registry's methods; every change is
//! published as a [`StateTransition`] on a broadcast channel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::domain::envelope::{AssetType, CurrencyPair};

/// Capacity of the transition broadcast channel.
const TRANSITION_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Types
// =============================================================================

/// Identity of a subscription within one connection.
///
/// Two subscriptions are the same subscription when channel, pair and asset
/// tag all match; channel parameters are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKey {
    /// Venue channel name.
    pub channel: String,
    /// Instrument pair, if the channel is per-instrument.
    pub pair: Option<CurrencyPair>,
    /// Asset category, if the channel is per-category.
    pub asset: Option<AssetType>,
}

impl ChannelKey {
    /// Create a key for a channel with no instrument scope.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pair: None,
            asset: None,
        }
    }

    /// Scope the key to an instrument pair.
    #[must_use]
    pub fn with_pair(mut self, pair: CurrencyPair) -> Self {
        self.pair = Some(pair);
        self
    }

    /// Scope the key to an asset category.
    #[must_use]
    pub const fn with_asset(mut self, asset: AssetType) -> Self {
        self.asset = Some(asset);
        self
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)?;
        if let Some(pair) = &self.pair {
            write!(f, ":{pair}")?;
        }
        if let Some(asset) = &self.asset {
            write!(f, ":{asset}")?;
        }
        Ok(())
    }
}

/// Per-channel subscription parameters.
///
/// `extra` is an opaque pass-through bag for venue-specific extensions; the
/// core never inspects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelParams {
    /// Candle interval for kline channels (e.g. `1m`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Book depth for order book channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Price level aggregation for order book channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<u32>,
    /// Venue-specific extension fields.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One logical subscription to a data channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSubscription {
    /// Venue channel name.
    pub channel: String,
    /// Instrument pair.
    pub pair: Option<CurrencyPair>,
    /// Asset category.
    pub asset: Option<AssetType>,
    /// Channel parameters.
    pub params: ChannelParams,
}

impl ChannelSubscription {
    /// Create a subscription to a channel.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pair: None,
            asset: None,
            params: ChannelParams::default(),
        }
    }

    /// Set the instrument pair.
    #[must_use]
    pub fn with_pair(mut self, pair: CurrencyPair) -> Self {
        self.pair = Some(pair);
        self
    }

    /// Set the asset category.
    #[must_use]
    pub const fn with_asset(mut self, asset: AssetType) -> Self {
        self.asset = Some(asset);
        self
    }

    /// Set the channel parameters.
    #[must_use]
    pub fn with_params(mut self, params: ChannelParams) -> Self {
        self.params = params;
        self
    }

    /// Identity key of this subscription.
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            channel: self.channel.clone(),
            pair: self.pair.clone(),
            asset: self.asset,
        }
    }
}

/// Subscription lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    /// Never registered, or removed.
    #[default]
    Unknown,
    /// Subscribe frame sent, awaiting acknowledgment.
    Subscribing,
    /// Venue acknowledged the subscription.
    Subscribed,
    /// Unsubscribe frame sent, awaiting acknowledgment.
    Unsubscribing,
}

impl ChannelState {
    /// Check if a transition is awaiting a venue acknowledgment.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Subscribing | Self::Unsubscribing)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Unsubscribing => "unsubscribing",
        }
    }
}

/// Subscription operation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionOperation {
    /// Subscribe to a channel.
    Subscribe,
    /// Unsubscribe from a channel.
    Unsubscribe,
}

impl SubscriptionOperation {
    /// The in-flight state this operation waits in.
    #[must_use]
    pub const fn pending_state(&self) -> ChannelState {
        match self {
            Self::Subscribe => ChannelState::Subscribing,
            Self::Unsubscribe => ChannelState::Unsubscribing,
        }
    }

    /// Get the operation name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Venue acknowledgment for a subscribe or unsubscribe request.
///
/// Acks are matched by channel key, not by correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    /// Key being acknowledged.
    pub key: ChannelKey,
    /// Operation being acknowledged.
    pub operation: SubscriptionOperation,
    /// `Err` carries the venue's rejection reason.
    pub outcome: Result<(), String>,
}

impl SubscriptionAck {
    /// Successful subscribe acknowledgment.
    #[must_use]
    pub const fn subscribed(key: ChannelKey) -> Self {
        Self {
            key,
            operation: SubscriptionOperation::Subscribe,
            outcome: Ok(()),
        }
    }

    /// Successful unsubscribe acknowledgment.
    #[must_use]
    pub const fn unsubscribed(key: ChannelKey) -> Self {
        Self {
            key,
            operation: SubscriptionOperation::Unsubscribe,
            outcome: Ok(()),
        }
    }

    /// Venue rejection.
    #[must_use]
    pub fn rejected(
        key: ChannelKey,
        operation: SubscriptionOperation,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            key,
            operation,
            outcome: Err(reason.into()),
        }
    }
}

/// Why an in-flight transition failed before being acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFailure {
    /// The venue rejected the request.
    Rejected(String),
    /// The connection dropped while waiting.
    ConnectionLost,
    /// The connection was shut down locally while waiting.
    Shutdown,
}

/// Outcome delivered to the waiter of an in-flight transition.
pub type AckResult = Result<(), AckFailure>;

/// A state change published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Key that changed.
    pub key: ChannelKey,
    /// Previous state.
    pub from: ChannelState,
    /// New state (`Unknown` means removed).
    pub to: ChannelState,
}

/// Result of starting a subscribe.
#[derive(Debug)]
pub enum BeginSubscribe {
    /// Entry created in `Subscribing`; await the receiver for the ack.
    Started(oneshot::Receiver<AckResult>),
    /// Key is already subscribed; nothing to do.
    AlreadySubscribed,
    /// Another transition for this key is awaiting its ack.
    InFlight(ChannelState),
}

/// Result of starting an unsubscribe.
#[derive(Debug)]
pub enum BeginUnsubscribe {
    /// Entry moved to `Unsubscribing`; await the receiver for the ack.
    Started(oneshot::Receiver<AckResult>),
    /// Key is not registered.
    NotSubscribed,
    /// Another transition for this key is awaiting its ack.
    InFlight(ChannelState),
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct Entry {
    subscription: ChannelSubscription,
    state: ChannelState,
    waiter: Option<oneshot::Sender<AckResult>>,
}

/// Per-entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Entries awaiting a subscribe ack.
    pub subscribing: usize,
    /// Acknowledged entries.
    pub subscribed: usize,
    /// Entries awaiting an unsubscribe ack.
    pub unsubscribing: usize,
}

impl RegistryStats {
    /// Total number of entries.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.subscribing + self.subscribed + self.unsubscribing
    }
}

/// Tracks the declared subscriptions of one connection.
///
/// Thread-safe; all transitions happen under a single lock, so an ack racing
/// with a timeout resolves exactly one way.
///
/// # Example
///
/// ```rust
/// use venue_stream::domain::subscription::{
///     BeginSubscribe, ChannelState, ChannelSubscription, SubscriptionAck, SubscriptionRegistry,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let sub = ChannelSubscription::new("trades");
///
/// let BeginSubscribe::Started(_ack) = registry.begin_subscribe(sub.clone()) else {
///     panic!("new key should start subscribing");
/// };
/// assert_eq!(registry.state(&sub.key()), ChannelState::Subscribing);
///
/// assert!(registry.acknowledge(&SubscriptionAck::subscribed(sub.key())));
/// assert_eq!(registry.state(&sub.key()), ChannelState::Subscribed);
/// ```
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<ChannelKey, Entry>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Start subscribing: `Unknown → Subscribing`.
    pub fn begin_subscribe(&self, subscription: ChannelSubscription) -> BeginSubscribe {
        let key = subscription.key();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&key) {
            return match entry.state {
                ChannelState::Subscribed => BeginSubscribe::AlreadySubscribed,
                state => BeginSubscribe::InFlight(state),
            };
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            key.clone(),
            Entry {
                subscription,
                state: ChannelState::Subscribing,
                waiter: Some(tx),
            },
        );
        self.publish(key, ChannelState::Unknown, ChannelState::Subscribing);

        BeginSubscribe::Started(rx)
    }

    /// Start unsubscribing: `Subscribed → Unsubscribing`.
    pub fn begin_unsubscribe(&self, key: &ChannelKey) -> BeginUnsubscribe {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(key) else {
            return BeginUnsubscribe::NotSubscribed;
        };

        if entry.state != ChannelState::Subscribed {
            return BeginUnsubscribe::InFlight(entry.state);
        }

        let (tx, rx) = oneshot::channel();
        entry.state = ChannelState::Unsubscribing;
        entry.waiter = Some(tx);
        self.publish(
            key.clone(),
            ChannelState::Subscribed,
            ChannelState::Unsubscribing,
        );

        BeginUnsubscribe::Started(rx)
    }

    /// Apply a venue acknowledgment.
    ///
    /// Returns `false` if the ack matches no in-flight transition (stale or
    /// duplicate acks are ignored).
    pub fn acknowledge(&self, ack: &SubscriptionAck) -> bool {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(&ack.key) else {
            return false;
        };
        if entry.state != ack.operation.pending_state() {
            return false;
        }
        let Some(waiter) = entry.waiter.take() else {
            return false;
        };

        let from = entry.state;
        let outcome = match (&ack.outcome, ack.operation) {
            (Ok(()), SubscriptionOperation::Subscribe) => {
                entry.state = ChannelState::Subscribed;
                Ok(())
            }
            (Ok(()), SubscriptionOperation::Unsubscribe) => {
                entries.remove(&ack.key);
                Ok(())
            }
            (Err(reason), operation) => {
                Self::revert_locked(&mut entries, &ack.key, operation);
                Err(AckFailure::Rejected(reason.clone()))
            }
        };

        let to = entries
            .get(&ack.key)
            .map_or(ChannelState::Unknown, |e| e.state);
        self.publish(ack.key.clone(), from, to);

        let _ = waiter.send(outcome);
        true
    }

    /// The ack deadline passed without an acknowledgment.
    ///
    /// Returns `false` if the ack won the race; the outcome is then already
    /// in the waiter's receiver.
    pub fn expire(&self, key: &ChannelKey, operation: SubscriptionOperation) -> bool {
        self.revert(key, operation)
    }

    /// The control frame for the transition could not be sent.
    pub fn abort(&self, key: &ChannelKey, operation: SubscriptionOperation) -> bool {
        self.revert(key, operation)
    }

    /// Revert an in-flight transition.
    ///
    /// `Subscribing` entries are removed; `Unsubscribing` entries return to
    /// `Subscribed`. Returns `false` if the transition was already resolved
    /// and nothing was reverted.
    fn revert(&self, key: &ChannelKey, operation: SubscriptionOperation) -> bool {
        let mut entries = self.entries.lock();

        let resolved = entries
            .get(key)
            .is_none_or(|e| e.state != operation.pending_state() || e.waiter.is_none());
        if resolved {
            return false;
        }

        let from = operation.pending_state();
        Self::revert_locked(&mut entries, key, operation);
        let to = entries.get(key).map_or(ChannelState::Unknown, |e| e.state);
        self.publish(key.clone(), from, to);
        true
    }

    /// Apply the connection-lost policy.
    ///
    /// Clears the registry. In-flight waiters fail with
    /// [`AckFailure::ConnectionLost`]. Returns the subscriptions the caller
    /// still wanted active (`Subscribed` or `Subscribing`) so a reconnection
    /// policy can re-issue them after redialing.
    pub fn connection_lost(&self) -> Vec<ChannelSubscription> {
        self.clear(&AckFailure::ConnectionLost)
    }

    /// Apply the local shutdown policy.
    ///
    /// The venue forgets a link's subscriptions once it closes, so the
    /// registry is cleared as on connection loss; in-flight waiters fail with
    /// [`AckFailure::Shutdown`]. Returns the subscriptions that were wanted.
    pub fn shutdown(&self) -> Vec<ChannelSubscription> {
        self.clear(&AckFailure::Shutdown)
    }

    fn clear(&self, failure: &AckFailure) -> Vec<ChannelSubscription> {
        let drained: Vec<(ChannelKey, Entry)> = self.entries.lock().drain().collect();
        let mut wanted = Vec::new();

        for (key, mut entry) in drained {
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send(Err(failure.clone()));
            }
            self.publish(key, entry.state, ChannelState::Unknown);

            if matches!(
                entry.state,
                ChannelState::Subscribed | ChannelState::Subscribing
            ) {
                wanted.push(entry.subscription);
            }
        }

        wanted
    }

    /// Get the state of a key (`Unknown` if absent).
    #[must_use]
    pub fn state(&self, key: &ChannelKey) -> ChannelState {
        self.entries
            .lock()
            .get(key)
            .map_or(ChannelState::Unknown, |e| e.state)
    }

    /// Get the subscription registered under a key.
    #[must_use]
    pub fn get(&self, key: &ChannelKey) -> Option<ChannelSubscription> {
        self.entries.lock().get(key).map(|e| e.subscription.clone())
    }

    /// Get all acknowledged subscriptions.
    #[must_use]
    pub fn subscribed(&self) -> Vec<ChannelSubscription> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state == ChannelState::Subscribed)
            .map(|e| e.subscription.clone())
            .collect()
    }

    /// Get every entry with its state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ChannelSubscription, ChannelState)> {
        self.entries
            .lock()
            .values()
            .map(|e| (e.subscription.clone(), e.state))
            .collect()
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get per-state counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.lock();
        let mut stats = RegistryStats::default();
        for entry in entries.values() {
            match entry.state {
                ChannelState::Subscribing => stats.subscribing += 1,
                ChannelState::Subscribed => stats.subscribed += 1,
                ChannelState::Unsubscribing => stats.unsubscribing += 1,
                ChannelState::Unknown => {}
            }
        }
        stats
    }

    fn revert_locked(
        entries: &mut HashMap<ChannelKey, Entry>,
        key: &ChannelKey,
        operation: SubscriptionOperation,
    ) {
        match operation {
            SubscriptionOperation::Subscribe => {
                entries.remove(key);
            }
            SubscriptionOperation::Unsubscribe => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.state = ChannelState::Subscribed;
                    entry.waiter = None;
                }
            }
        }
    }

    fn publish(&self, key: ChannelKey, from: ChannelState, to: ChannelState) {
        tracing::debug!(
            key = %key,
            from = from.as_str(),
            to = to.as_str(),
            "Subscription state changed"
        );
        // No receivers is fine.
        let _ = self.transitions.send(StateTransition { key, from, to });
    }
}

// =============================================================================
// Tests
// =============================================================================
