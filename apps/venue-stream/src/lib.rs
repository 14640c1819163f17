#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Venue Stream - Streaming Connection Core
//!
//! Maintains persistent WebSocket connections to trading venues, tracks the
//! lifecycle of channel subscriptions over them, correlates request/response
//! pairs and keeps links alive with heartbeats.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Frames, envelopes and the subscription state machine
//!   - `frame`: Raw inbound/outbound frames
//!   - `envelope`: Parsed market data (funding, klines, positions)
//!   - `subscription`: Per-connection subscription registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Connection contract, venue codecs, consumers, events, reporter
//!   - `services`: Subscribe/unsubscribe round trips
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: `tokio-tungstenite` connection, pings, rate limit, proxy
//!   - `correlation`: Pending request table
//!   - `dispatch`: Inbound frame routing
//!   - `codec`: JSON and `MessagePack` encoders
//!   - `config`, `metrics`, `telemetry`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//! Venue WS ◄──► WebSocketConnection ◄── PingScheduler
//!                      │
//!                      ▼
//!                 Dispatcher ──► MessageCorrelator    (replies)
//!                      │    ──► SubscriptionRegistry (acks)
//!                      │    ──► ConsumerRegistry     (envelopes)
//!                      ▼
//!               StreamEvent channel (unhandled, lost)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use venue_stream::*;
//!
//! let setup = ConnectionSetup::new("wss://stream.venue.example/ws");
//! let connection = Arc::new(WebSocketConnection::new(setup.clone()));
//! connection.dial(&DialerConfig::default(), &HeaderMap::new()).await?;
//!
//! let registry = Arc::new(SubscriptionRegistry::new());
//! let consumers = Arc::new(ConsumerRegistry::new());
//! let dispatcher = Dispatcher::for_websocket(&connection, codec.clone(), registry.clone(), consumers);
//! tokio::spawn(dispatcher.run());
//!
//! let subscriptions = SubscriptionService::new(connection, codec, registry, &setup);
//! subscriptions.subscribe(ChannelSubscription::new("trades")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core stream types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// In-process venue and JSON codec for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::envelope::{
    AssetType, CurrencyPair, FundingData, KlineData, PositionUpdated, Side,
    UnhandledMessageWarning,
};
pub use domain::frame::{Frame, FrameType};
pub use domain::subscription::{
    ChannelKey, ChannelParams, ChannelState, ChannelSubscription, StateTransition,
    SubscriptionAck, SubscriptionRegistry,
};

// Ports
pub use application::ports::{
    Connection, ConnectionExt, ConsumerRegistry, CorrelationId, Decoded, DialerConfig, Envelope,
    EventSink, FrameClassifier, HeaderMap, NoopReporter, PayloadEncoder, PayloadKind, PingHandler,
    Reporter, StreamError, StreamEvent, SubscriptionCodec,
};

// Services
pub use application::services::{SubscribeOutcome, SubscriptionError, SubscriptionService};

// Infrastructure
pub use infrastructure::codec::{JsonEncoder, MsgPackEncoder};
pub use infrastructure::config::{ConfigError, ConnectionSetup, StreamSettings};
pub use infrastructure::correlation::MessageCorrelator;
pub use infrastructure::dispatch::{DispatchExit, Dispatcher};
pub use infrastructure::websocket::WebSocketConnection;

// Metrics
pub use infrastructure::metrics::{MetricsReporter, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
