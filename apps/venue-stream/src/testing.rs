//! Test Harness
//!
//! An in-process WebSocket venue and a JSON venue codec for exercising
//! connections without a real exchange.
//!
//! # Wire format of [`JsonTestVenue`]
//!
//! ```text
//! request      {"id": 17, "method": "..."}            reply {"id": 17, "result": "ok"}
//! subscribe    {"op": "subscribe", "channel": "trades", "pair": "BTC-USD", "asset": "spot"}
//! ack          {"event": "subscribed", "channel": "trades", "pair": "BTC-USD", "asset": "spot"}
//! rejection    {"event": "error", "op": "subscribe", "channel": "trades", "message": "..."}
//! data         {"type": "funding" | "kline" | "position", "data": {...}}
//! custom data  {"type": "<anything else>", ...}
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Bytes, Message};

use crate::application::ports::{
    CodecError, CorrelationId, Decoded, Envelope, FrameClassifier, SubscriptionCodec,
};
use crate::domain::envelope::AssetType;
use crate::domain::frame::{Frame, FrameType};
use crate::domain::subscription::{
    ChannelKey, ChannelSubscription, SubscriptionAck, SubscriptionOperation,
};

// =============================================================================
// JSON Test Venue
// =============================================================================

/// Venue codec speaking the simple JSON dialect documented above.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTestVenue;

impl JsonTestVenue {
    /// Create the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Replies the venue sends for an inbound client frame.
    ///
    /// Requests carrying an `id` get `{"id": .., "result": "ok"}`;
    /// subscribe/unsubscribe messages get the matching ack.
    #[must_use]
    pub fn respond(frame: &Frame) -> Vec<Frame> {
        let Some(value) = parse(frame) else {
            return Vec::new();
        };

        if let Some(id) = value.get("id") {
            return vec![Frame::text(json!({ "id": id, "result": "ok" }).to_string())];
        }

        let event = match value.get("op").and_then(Value::as_str) {
            Some("subscribe") => "subscribed",
            Some("unsubscribe") => "unsubscribed",
            _ => return Vec::new(),
        };
        let mut ack = json!({ "event": event });
        for field in ["channel", "pair", "asset"] {
            if let Some(v) = value.get(field) {
                ack[field] = v.clone();
            }
        }
        vec![Frame::text(ack.to_string())]
    }

    fn decode_ack(value: &Value, event: &str) -> Option<SubscriptionAck> {
        let key = channel_key(value)?;
        match event {
            "subscribed" => Some(SubscriptionAck::subscribed(key)),
            "unsubscribed" => Some(SubscriptionAck::unsubscribed(key)),
            "error" => {
                let operation = match value.get("op").and_then(Value::as_str) {
                    Some("unsubscribe") => SubscriptionOperation::Unsubscribe,
                    _ => SubscriptionOperation::Subscribe,
                };
                let reason = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected");
                Some(SubscriptionAck::rejected(key, operation, reason))
            }
            _ => None,
        }
    }

    fn decode_envelope(value: Value, kind: &str) -> Option<Envelope> {
        match kind {
            "funding" => serde_json::from_value(value.get("data")?.clone())
                .ok()
                .map(Envelope::Funding),
            "kline" => serde_json::from_value(value.get("data")?.clone())
                .ok()
                .map(Envelope::Kline),
            "position" => serde_json::from_value(value.get("data")?.clone())
                .ok()
                .map(Envelope::PositionUpdated),
            _ => Some(Envelope::Custom {
                kind: kind.to_string(),
                payload: value,
            }),
        }
    }

    fn message(op: &str, subscription: &ChannelSubscription) -> Result<Value, CodecError> {
        let mut message = json!({ "op": op, "channel": subscription.channel });
        if let Some(pair) = &subscription.pair {
            message["pair"] = json!(pair.to_string());
        }
        if let Some(asset) = subscription.asset {
            message["asset"] = json!(asset.as_str());
        }
        let params = serde_json::to_value(&subscription.params)?;
        if params.as_object().is_some_and(|p| !p.is_empty()) {
            message["params"] = params;
        }
        Ok(message)
    }
}

fn parse(frame: &Frame) -> Option<Value> {
    match frame.frame_type {
        FrameType::Text | FrameType::Binary => serde_json::from_slice(&frame.raw).ok(),
        _ => None,
    }
}

fn channel_key(value: &Value) -> Option<ChannelKey> {
    let mut key = ChannelKey::new(value.get("channel")?.as_str()?);
    if let Some(pair) = value.get("pair").and_then(Value::as_str) {
        key = key.with_pair(pair.parse().ok()?);
    }
    if let Some(asset) = value.get("asset") {
        key = key.with_asset(serde_json::from_value::<AssetType>(asset.clone()).ok()?);
    }
    Some(key)
}

impl FrameClassifier for JsonTestVenue {
    fn correlation_id(&self, frame: &Frame) -> Option<CorrelationId> {
        let value = parse(frame)?;
        match value.get("id")? {
            Value::Number(n) => n.as_i64().map(CorrelationId::Numeric),
            Value::String(s) => Some(CorrelationId::Text(s.clone())),
            _ => None,
        }
    }

    fn decode(&self, frame: &Frame) -> Option<Decoded> {
        let value = parse(frame)?;

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            return Self::decode_ack(&value, event).map(Decoded::Ack);
        }

        let kind = value.get("type")?.as_str()?.to_string();
        Self::decode_envelope(value, &kind).map(Decoded::Envelope)
    }
}

impl SubscriptionCodec for JsonTestVenue {
    fn subscribe_message(&self, subscription: &ChannelSubscription) -> Result<Value, CodecError> {
        Self::message("subscribe", subscription)
    }

    fn unsubscribe_message(
        &self,
        subscription: &ChannelSubscription,
    ) -> Result<Value, CodecError> {
        Self::message("unsubscribe", subscription)
    }
}

// =============================================================================
// Mock Venue Server
// =============================================================================

/// Produces the server's replies to a received frame.
pub type Responder = Arc<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

#[derive(Debug)]
enum Command {
    Send(Message),
    Close,
}

/// In-process WebSocket venue on `127.0.0.1`.
///
/// Records every frame the client sends (pings included), optionally
/// answers through a [`Responder`], and can push frames or close the link
/// on demand. Clients are served one after another.
pub struct MockVenueServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MockVenueServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVenueServer")
            .field("addr", &self.addr)
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl MockVenueServer {
    /// Start a server that never replies on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(Arc::new(|_: &Frame| Vec::<Frame>::new())).await
    }

    /// Start a server that speaks [`JsonTestVenue`].
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn json_venue() -> std::io::Result<Self> {
        Self::start_with(Arc::new(JsonTestVenue::respond)).await
    }

    /// Start a server answering through `responder`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start_with(responder: Responder) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(serve(
            listener,
            responder,
            received_tx,
            command_rx,
            Arc::clone(&connections),
        ));

        Ok(Self {
            addr,
            received,
            commands,
            connections,
            task,
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of the server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of clients accepted so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next frame received from the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.received.recv().await
    }

    /// Next non-control frame received from the client.
    pub async fn recv_data(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            if !frame.frame_type.is_control() {
                return Some(frame);
            }
        }
    }

    /// Frames received so far, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.received.try_recv().ok()).collect()
    }

    /// Push a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Send(Message::text(text.into())));
    }

    /// Push a binary frame to the client.
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) {
        let _ = self
            .commands
            .send(Command::Send(Message::Binary(Bytes::from(data.into()))));
    }

    /// Close the current client's link.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for MockVenueServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::new(FrameType::Text, text.as_bytes().to_vec())),
        Message::Binary(data) => Some(Frame::binary(data.to_vec())),
        Message::Ping(data) => Some(Frame::new(FrameType::Ping, data.to_vec())),
        Message::Pong(data) => Some(Frame::new(FrameType::Pong, data.to_vec())),
        Message::Close(_) | Message::Frame(_) => None,
    }
}

fn to_message(frame: Frame) -> Message {
    match frame.frame_type {
        FrameType::Text => Message::text(frame.to_text_lossy()),
        FrameType::Binary => Message::Binary(Bytes::from(frame.raw)),
        FrameType::Ping => Message::Ping(Bytes::from(frame.raw)),
        FrameType::Pong => Message::Pong(Bytes::from(frame.raw)),
        FrameType::Close => Message::Close(None),
    }
}

async fn serve(
    listener: TcpListener,
    responder: Responder,
    received: mpsc::UnboundedSender<Frame>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connections: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        connections.fetch_add(1, Ordering::SeqCst);
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                    None => return,
                },
                message = source.next() => {
                    let Some(Ok(message)) = message else {
                        break;
                    };
                    let Some(frame) = to_frame(message) else {
                        continue;
                    };
                    let replies = responder(&frame);
                    let _ = received.send(frame);
                    for reply in replies {
                        if sink.send(to_message(reply)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
