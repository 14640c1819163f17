//! WebSocket Connection
//!
//! [`Connection`] implementation over `tokio-tungstenite`.
//!
//! # Resources per dialed session
//!
//! - One write half behind the shared [`SendPath`] (serialized, rate limited)
//! - One read half behind its own lock (single reader, normally the dispatcher)
//! - One [`CancellationToken`]; cancelling it releases blocked reads,
//!   sends and correlated requests with [`StreamError::Shutdown`]
//! - One spawned [`PingScheduler`]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Connection, CorrelationId, DialerConfig, EventSink, HeaderMap, PayloadEncoder, PingHandler,
    Reporter, StreamError, StreamEvent, report_latency,
};
use crate::domain::frame::{Frame, FrameType};
use crate::infrastructure::codec::JsonEncoder;
use crate::infrastructure::config::ConnectionSetup;
use crate::infrastructure::correlation::{FailReason, MessageCorrelator};
use crate::infrastructure::metrics;
use crate::infrastructure::websocket::ping::{FrameSink, PingScheduler, PingTracker};
use crate::infrastructure::websocket::proxy::{self, ProxyEndpoint};
use crate::infrastructure::websocket::rate_limit::RateLimiter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// =============================================================================
// Send Path
// =============================================================================

struct SendInner {
    sink: Option<WsSink>,
    limiter: RateLimiter,
}

/// The single serialized write path of a connection.
///
/// Every outbound frame (JSON, raw, correlated requests, pings) takes the
/// same lock, then a rate-limit slot, then writes.
pub struct SendPath {
    inner: tokio::sync::Mutex<SendInner>,
}

impl std::fmt::Debug for SendPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPath").finish_non_exhaustive()
    }
}

impl SendPath {
    /// Create a detached send path limited to `rate_limit` messages per
    /// second (0 = unlimited).
    #[must_use]
    pub fn new(rate_limit: u32) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(SendInner {
                sink: None,
                limiter: RateLimiter::per_second(rate_limit),
            }),
        }
    }

    async fn attach(&self, sink: WsSink) {
        self.inner.lock().await.sink = Some(sink);
    }

    async fn detach(&self) -> Option<WsSink> {
        self.inner.lock().await.sink.take()
    }

    async fn send(&self, message: Message) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;
        inner.limiter.acquire().await;
        let sink = inner.sink.as_mut().ok_or(StreamError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| StreamError::Send(e.to_string()))
    }
}

#[async_trait]
impl FrameSink for SendPath {
    async fn send_frame(&self, frame_type: FrameType, raw: Vec<u8>) -> Result<(), StreamError> {
        self.send(frame_to_message(frame_type, raw)?).await?;
        metrics::record_frame_sent(frame_type);
        Ok(())
    }
}

fn frame_to_message(frame_type: FrameType, raw: Vec<u8>) -> Result<Message, StreamError> {
    Ok(match frame_type {
        FrameType::Text => {
            let text = String::from_utf8(raw)
                .map_err(|e| StreamError::Send(format!("text frame is not valid UTF-8: {e}")))?;
            Message::text(text)
        }
        FrameType::Binary => Message::binary(raw),
        FrameType::Ping => Message::Ping(Bytes::from(raw)),
        FrameType::Pong => Message::Pong(Bytes::from(raw)),
        FrameType::Close => Message::Close(None),
    })
}

/// Map an inbound message to a frame. `Ok(None)` means skip (raw frames).
fn message_to_frame(message: Message) -> Result<Option<Frame>, StreamError> {
    Ok(match message {
        Message::Text(text) => Some(Frame::new(FrameType::Text, text.as_bytes().to_vec())),
        Message::Binary(data) => Some(Frame::binary(data.to_vec())),
        Message::Ping(data) => Some(Frame::new(FrameType::Ping, data.to_vec())),
        Message::Pong(data) => Some(Frame::new(FrameType::Pong, data.to_vec())),
        Message::Close(close) => {
            let reason = close.map_or_else(
                || "closed by peer".to_string(),
                |c| format!("closed by peer: {} {}", c.code, c.reason),
            );
            return Err(StreamError::ConnectionLost(reason));
        }
        Message::Frame(_) => None,
    })
}

// =============================================================================
// Connection
// =============================================================================

struct Session {
    cancel: CancellationToken,
    ping_cancel: CancellationToken,
    ping_task: JoinHandle<()>,
}

/// WebSocket link to one venue endpoint.
pub struct WebSocketConnection {
    url: RwLock<String>,
    proxy: RwLock<Option<ProxyEndpoint>>,
    authenticated: bool,
    reporter: Arc<dyn Reporter>,
    encoder: Arc<dyn PayloadEncoder>,
    send_path: Arc<SendPath>,
    reader: tokio::sync::Mutex<Option<WsSource>>,
    correlator: Arc<MessageCorrelator>,
    ping_handler: watch::Sender<PingHandler>,
    ping_tracker: Arc<PingTracker>,
    session: Mutex<Option<Session>>,
    dial_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    last_message_id: AtomicI64,
    events: EventSink,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("url", &*self.url.read())
            .field("authenticated", &self.authenticated)
            .field("connected", &self.is_connected())
            .field("pending_requests", &self.correlator.len())
            .finish_non_exhaustive()
    }
}

impl WebSocketConnection {
    /// Create an undialed connection with the JSON encoder and no event sink.
    #[must_use]
    pub fn new(setup: ConnectionSetup) -> Self {
        let (ping_handler, _) = watch::channel(PingHandler::default());
        Self {
            url: RwLock::new(setup.url),
            proxy: RwLock::new(None),
            authenticated: setup.authenticated,
            ping_tracker: Arc::new(PingTracker::new(Arc::clone(&setup.reporter))),
            reporter: setup.reporter,
            encoder: Arc::new(JsonEncoder::new()),
            send_path: Arc::new(SendPath::new(setup.rate_limit)),
            reader: tokio::sync::Mutex::new(None),
            correlator: Arc::new(MessageCorrelator::new(setup.response_max_limit)),
            ping_handler,
            session: Mutex::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            last_message_id: AtomicI64::new(0),
            events: EventSink::disabled(),
        }
    }

    /// Use a different payload encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn PayloadEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Emit connection events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Correlation table shared with the dispatcher.
    #[must_use]
    pub fn correlator(&self) -> Arc<MessageCorrelator> {
        Arc::clone(&self.correlator)
    }

    /// Ping round-trip tracker shared with the dispatcher.
    #[must_use]
    pub fn ping_tracker(&self) -> Arc<PingTracker> {
        Arc::clone(&self.ping_tracker)
    }

    /// Event sink shared with the dispatcher.
    #[must_use]
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    /// Latency reporter.
    #[must_use]
    pub fn reporter(&self) -> Arc<dyn Reporter> {
        Arc::clone(&self.reporter)
    }

    /// Whether this link carries authenticated traffic.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn session_token(&self) -> Option<CancellationToken> {
        self.session.lock().as_ref().map(|s| s.cancel.clone())
    }

    /// Token of the live session, or the reason there is none.
    fn live_token(&self) -> Result<CancellationToken, StreamError> {
        let token = self.session_token().ok_or(StreamError::NotConnected)?;
        if token.is_cancelled() {
            return Err(StreamError::Shutdown);
        }
        if !self.is_connected() {
            return Err(StreamError::NotConnected);
        }
        Ok(token)
    }

    async fn send_frame(&self, frame_type: FrameType, raw: Vec<u8>) -> Result<(), StreamError> {
        let token = self.live_token()?;
        tokio::select! {
            biased;
            () = token.cancelled() => Err(StreamError::Shutdown),
            result = self.send_path.send_frame(frame_type, raw) => result,
        }
    }

    /// Stop the ping task and mark the link down after a read failure.
    fn mark_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(session) = self.session.lock().as_ref() {
                session.ping_cancel.cancel();
            }
            metrics::record_disconnected();
            metrics::record_connection_lost();
            tracing::warn!(url = %self.url(), reason, "Venue connection lost");
        }
    }

    /// Release everything held by a previous session.
    async fn teardown(&self, session: Session, send_close: bool) {
        session.cancel.cancel();
        session.ping_cancel.cancel();
        let _ = session.ping_task.await;

        if let Some(mut sink) = self.send_path.detach().await {
            if send_close {
                let _ = sink.send(Message::Close(None)).await;
            }
            let _ = sink.close().await;
        }
        self.reader.lock().await.take();
    }

    async fn open(
        &self,
        url: &str,
        dialer: &DialerConfig,
        headers: &HeaderMap,
    ) -> Result<WsStream, StreamError> {
        let connect_err = |message: String| StreamError::Connect {
            url: url.to_string(),
            message,
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| StreamError::InvalidUrl {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        for (name, value) in headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let mut config = WebSocketConfig::default();
        config.max_message_size = dialer.max_message_size.or(config.max_message_size);
        let connector = dialer.tls.clone().map(Connector::Rustls);

        let proxy = self.proxy.read().clone();
        let stream = match proxy {
            None => {
                tokio_tungstenite::connect_async_tls_with_config(
                    request,
                    Some(config),
                    dialer.disable_nagle,
                    connector,
                )
                .await
                .map_err(|e| connect_err(e.to_string()))?
                .0
            }
            Some(proxy) => {
                let (host, port) = proxy::target_authority(url)?;
                let tcp = proxy::connect_via_proxy(&proxy, &host, port).await?;
                if dialer.disable_nagle {
                    tcp.set_nodelay(true)
                        .map_err(|e| connect_err(e.to_string()))?;
                }
                tokio_tungstenite::client_async_tls_with_config(
                    request,
                    tcp,
                    Some(config),
                    connector,
                )
                .await
                .map_err(|e| connect_err(e.to_string()))?
                .0
            }
        };

        Ok(stream)
    }
}

fn install_crypto_provider() {
    // Fails only if a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn dial(&self, dialer: &DialerConfig, headers: &HeaderMap) -> Result<(), StreamError> {
        let _dial = self.dial_lock.lock().await;
        if self.is_connected() {
            return Err(StreamError::AlreadyConnected);
        }

        // Clean up after a lost session before reusing the resources
        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            self.teardown(stale, false).await;
        }

        let url = self.url();
        tracing::info!(url = %url, authenticated = self.authenticated, "Dialing venue stream");
        install_crypto_provider();

        let stream =
            tokio::time::timeout(dialer.handshake_timeout, self.open(&url, dialer, headers))
                .await
                .map_err(|_| StreamError::Connect {
                    url: url.clone(),
                    message: format!("handshake timed out after {:?}", dialer.handshake_timeout),
                })??;

        let (sink, source) = stream.split();
        self.send_path.attach(sink).await;
        *self.reader.lock().await = Some(source);
        self.ping_tracker.reset();

        let cancel = CancellationToken::new();
        let ping_cancel = cancel.child_token();
        let scheduler = PingScheduler::new(
            self.ping_handler.subscribe(),
            Arc::clone(&self.send_path) as Arc<dyn FrameSink>,
            Arc::clone(&self.ping_tracker),
            self.events.clone(),
            ping_cancel.clone(),
        );
        let ping_task = tokio::spawn(scheduler.run());

        *self.session.lock() = Some(Session {
            cancel,
            ping_cancel,
            ping_task,
        });
        self.connected.store(true, Ordering::SeqCst);
        metrics::record_connected();

        tracing::info!(url = %url, "Venue stream connected");
        self.events.emit(StreamEvent::Connected { url });
        Ok(())
    }

    async fn read_message(&self) -> Result<Frame, StreamError> {
        let token = self.live_token()?;
        let mut reader = self.reader.lock().await;

        loop {
            let source = reader.as_mut().ok_or(StreamError::NotConnected)?;
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(StreamError::Shutdown),
                next = source.next() => next,
            };

            let result = match next {
                None => Err(StreamError::ConnectionLost("stream ended".to_string())),
                Some(Err(e)) => Err(StreamError::ConnectionLost(e.to_string())),
                Some(Ok(message)) => message_to_frame(message),
            };

            match result {
                Ok(Some(frame)) => {
                    metrics::record_frame_received(frame.frame_type);
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    reader.take();
                    self.mark_lost(&e.to_string());
                    return Err(e);
                }
            }
        }
    }

    async fn send_json_message(&self, payload: &serde_json::Value) -> Result<(), StreamError> {
        let raw = self.encoder.encode(payload)?;
        self.send_frame(self.encoder.frame_type(), raw).await
    }

    async fn send_raw_message(
        &self,
        frame_type: FrameType,
        raw: Vec<u8>,
    ) -> Result<(), StreamError> {
        self.send_frame(frame_type, raw).await
    }

    async fn send_message_return_response(
        &self,
        id: CorrelationId,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, StreamError> {
        let token = self.live_token()?;
        let raw = self.encoder.encode(payload)?;
        let started = Instant::now();

        let pending = self.correlator.register(id)?;
        if let Err(e) = self.send_frame(self.encoder.frame_type(), raw.clone()).await {
            pending.cancel();
            return Err(e);
        }

        let reply = tokio::select! {
            biased;
            () = token.cancelled() => Err(StreamError::Shutdown),
            reply = pending.wait() => reply,
        }?;

        report_latency(self.reporter.as_ref(), "request", &raw, started.elapsed());
        Ok(reply)
    }

    fn setup_ping_handler(&self, handler: PingHandler) {
        tracing::debug!(
            delay_ms = handler.delay.as_millis(),
            native = handler.native,
            "Ping handler updated"
        );
        self.ping_handler.send_replace(handler);
    }

    fn generate_message_id(&self, high_precision: bool) -> i64 {
        let now = Utc::now();
        let seed = if high_precision {
            now.timestamp_nanos_opt().unwrap_or(i64::MAX)
        } else {
            now.timestamp_millis()
        };

        let mut last = self.last_message_id.load(Ordering::Acquire);
        loop {
            let next = seed.max(last.saturating_add(1));
            match self.last_message_id.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn set_url(&self, url: &str) -> Result<(), StreamError> {
        if self.is_connected() {
            return Err(StreamError::AlreadyConnected);
        }
        proxy::target_authority(url)?;
        *self.url.write() = url.to_string();
        Ok(())
    }

    fn url(&self) -> String {
        self.url.read().clone()
    }

    fn set_proxy(&self, proxy: Option<String>) -> Result<(), StreamError> {
        let endpoint = proxy.as_deref().map(ProxyEndpoint::parse).transpose()?;
        *self.proxy.write() = endpoint;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), StreamError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        session.cancel.cancel();
        if self.connected.swap(false, Ordering::SeqCst) {
            metrics::record_disconnected();
        }
        self.correlator.fail_all(&FailReason::Shutdown);
        self.teardown(session, true).await;

        let url = self.url();
        tracing::info!(url = %url, "Venue stream shut down");
        self.events.emit(StreamEvent::Disconnected { url });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn connection() -> WebSocketConnection {
        WebSocketConnection::new(ConnectionSetup::new("ws://127.0.0.1:9"))
    }

    #[test]
    fn message_ids_strictly_increase() {
        let conn = connection();
        let mut last = 0;
        for i in 0..1_000 {
            let id = conn.generate_message_id(i % 2 == 0);
            assert!(id > last, "{id} <= {last}");
            last = id;
        }
    }

    #[test]
    fn message_ids_unique_across_threads() {
        let conn = Arc::new(connection());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || {
                    (0..1_000)
                        .map(|_| conn.generate_message_id(false))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    proptest! {
        #[test]
        fn ids_increase_for_any_precision_mix(
            modes in proptest::collection::vec(any::<bool>(), 1..200)
        ) {
            let conn = connection();
            let mut last = i64::MIN;
            for high_precision in modes {
                let id = conn.generate_message_id(high_precision);
                prop_assert!(id > last);
                last = id;
            }
        }
    }

    #[test]
    fn low_precision_ids_seed_from_millis() {
        let before = Utc::now().timestamp_millis();
        let id = connection().generate_message_id(false);
        assert!(id >= before);
        assert!(id < before + 60_000);
    }

    #[test]
    fn set_url_validates() {
        let conn = connection();
        assert!(conn.set_url("wss://venue.test/ws").is_ok());
        assert_eq!(conn.url(), "wss://venue.test/ws");
        assert!(matches!(
            conn.set_url("ftp://venue.test"),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn set_proxy_validates() {
        let conn = connection();
        assert!(conn.set_proxy(Some("http://proxy.local:3128".into())).is_ok());
        assert!(conn.set_proxy(Some("socks5://proxy.local".into())).is_err());
        assert!(conn.set_proxy(None).is_ok());
    }

    #[tokio::test]
    async fn operations_before_dial() {
        let conn = connection();
        assert!(!conn.is_connected());
        assert!(matches!(conn.read_message().await, Err(StreamError::NotConnected)));
        assert!(matches!(
            conn.send_raw_message(FrameType::Text, b"hi".to_vec()).await,
            Err(StreamError::NotConnected)
        ));
        // Shutdown of an undialed connection is a no-op
        assert!(conn.shutdown().await.is_ok());
        assert!(conn.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn dial_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = WebSocketConnection::new(ConnectionSetup::new(format!("ws://{addr}")));
        let err = conn
            .dial(&DialerConfig::default(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Connect { .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn dial_times_out_on_silent_peer() {
        // Accepts TCP but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });

        let conn = WebSocketConnection::new(ConnectionSetup::new(format!("ws://{addr}")));
        let dialer =
            DialerConfig::default().with_handshake_timeout(std::time::Duration::from_millis(100));
        let err = conn.dial(&dialer, &HeaderMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn frame_message_mapping() {
        assert!(matches!(
            frame_to_message(FrameType::Text, b"{}".to_vec()).unwrap(),
            Message::Text(_)
        ));
        assert!(frame_to_message(FrameType::Text, vec![0xff]).is_err());
        assert!(matches!(
            frame_to_message(FrameType::Ping, vec![1]).unwrap(),
            Message::Ping(_)
        ));

        let frame = message_to_frame(Message::binary(vec![1, 2]))
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::binary(vec![1, 2]));
        assert!(matches!(
            message_to_frame(Message::Close(None)),
            Err(StreamError::ConnectionLost(_))
        ));
    }
}
