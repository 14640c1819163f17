//! Connection Port (Driven Port)
//!
//! The venue-agnostic contract every duplex venue link implements. The
//! dispatcher, subscription service and ping scheduler only talk to a venue
//! through this trait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::application::ports::venue_port::CodecError;
use crate::domain::frame::{Frame, FrameType};

/// Handshake headers sent on dial.
pub type HeaderMap = tokio_tungstenite::tungstenite::http::HeaderMap;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Errors
// =============================================================================

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Handshake failed or timed out.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Failure details.
        message: String,
    },

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// No reply arrived for a correlated request in time.
    #[error("no response for request {id} within {timeout:?}")]
    CorrelationTimeout {
        /// Request correlation id.
        id: CorrelationId,
        /// Time waited.
        timeout: Duration,
    },

    /// The link closed or failed while in use.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was shut down locally.
    #[error("connection shut down")]
    Shutdown,

    /// Operation requires a dialed connection.
    #[error("not connected")]
    NotConnected,

    /// Operation is not allowed while connected.
    #[error("already connected")]
    AlreadyConnected,

    /// A request with the same correlation id is still outstanding.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// URL could not be parsed or has an unsupported scheme.
    #[error("invalid url {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Failure details.
        message: String,
    },

    /// HTTP CONNECT proxy negotiation failed.
    #[error("proxy error: {0}")]
    Proxy(String),
}

/// A payload that cannot be encoded is never written, so it fails the send.
impl From<CodecError> for StreamError {
    fn from(e: CodecError) -> Self {
        Self::Send(format!("failed to encode payload: {e}"))
    }
}

impl StreamError {
    /// Check if the error means the link is gone (lost or shut down).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Shutdown)
    }
}

// =============================================================================
// Types
// =============================================================================

/// Identifier carried by a request and echoed by its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    /// Integer id, usually from [`Connection::generate_message_id`].
    Numeric(i64),
    /// Venue-assigned string id.
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(id: i64) -> Self {
        Self::Numeric(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

/// Keep-alive configuration.
///
/// A zero `delay` disables pinging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingHandler {
    /// Send a transport ping control frame instead of a custom message.
    pub native: bool,
    /// Frame type of the custom message.
    pub message_type: FrameType,
    /// Ping payload.
    pub message: Vec<u8>,
    /// Interval between pings.
    pub delay: Duration,
}

impl PingHandler {
    /// Transport-level ping control frames every `delay`.
    #[must_use]
    pub const fn native(delay: Duration) -> Self {
        Self {
            native: true,
            message_type: FrameType::Ping,
            message: Vec::new(),
            delay,
        }
    }

    /// Application-level ping message every `delay`.
    #[must_use]
    pub fn custom(message_type: FrameType, message: impl Into<Vec<u8>>, delay: Duration) -> Self {
        Self {
            native: false,
            message_type,
            message: message.into(),
            delay,
        }
    }

    /// No pinging.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::native(Duration::ZERO)
    }

    /// Check if pings should be sent.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero()
    }
}

impl Default for PingHandler {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Dial parameters.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Bound on TCP connect, proxy negotiation and handshake together.
    pub handshake_timeout: Duration,
    /// TLS client configuration; `None` uses the default webpki roots.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Set `TCP_NODELAY` on the socket.
    pub disable_nagle: bool,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: Option<usize>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
            disable_nagle: true,
            max_message_size: None,
        }
    }
}

impl DialerConfig {
    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Use a custom TLS configuration.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

// =============================================================================
// Port
// =============================================================================

/// A duplex link to one venue endpoint.
///
/// Implementations serialize all writes through a single send path and
/// allow exactly one reader.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the link. Exactly one attempt, bounded by the handshake timeout.
    async fn dial(&self, dialer: &DialerConfig, headers: &HeaderMap) -> Result<(), StreamError>;

    /// Wait for the next inbound frame.
    ///
    /// Returns [`StreamError::ConnectionLost`] when the peer closes or the
    /// socket fails, [`StreamError::Shutdown`] after a local shutdown.
    async fn read_message(&self) -> Result<Frame, StreamError>;

    /// Encode a structured payload and send it.
    async fn send_json_message(&self, payload: &serde_json::Value) -> Result<(), StreamError>;

    /// Send pre-encoded bytes with an explicit frame type.
    async fn send_raw_message(&self, frame_type: FrameType, raw: Vec<u8>)
    -> Result<(), StreamError>;

    /// Send a payload and wait for the reply carrying the same correlation id.
    async fn send_message_return_response(
        &self,
        id: CorrelationId,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, StreamError>;

    /// Install or replace the keep-alive configuration.
    fn setup_ping_handler(&self, handler: PingHandler);

    /// Produce a unique, strictly increasing id for this connection.
    fn generate_message_id(&self, high_precision: bool) -> i64;

    /// Change the endpoint. Rejected while connected.
    fn set_url(&self, url: &str) -> Result<(), StreamError>;

    /// Current endpoint.
    fn url(&self) -> String;

    /// Route the next dial through an HTTP CONNECT proxy (`None` to dial direct).
    fn set_proxy(&self, proxy: Option<String>) -> Result<(), StreamError>;

    /// Check if the link is currently dialed.
    fn is_connected(&self) -> bool;

    /// Close the link and release every waiter. Idempotent.
    async fn shutdown(&self) -> Result<(), StreamError>;
}

/// Convenience methods for any [`Connection`].
#[async_trait]
pub trait ConnectionExt: Connection {
    /// Serialize any payload and send it.
    async fn send_json<T>(&self, payload: &T) -> Result<(), StreamError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(CodecError::from)?;
        self.send_json_message(&value).await
    }

    /// Send a correlated request with a freshly generated numeric id.
    ///
    /// `build` receives the id so it can be embedded in the payload.
    async fn request<F>(&self, build: F) -> Result<Vec<u8>, StreamError>
    where
        F: FnOnce(i64) -> serde_json::Value + Send,
    {
        let id = self.generate_message_id(false);
        let payload = build(id);
        self.send_message_return_response(CorrelationId::Numeric(id), &payload)
            .await
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
