//! Venue Ports (Driven Ports)
//!
//! Per-venue knowledge lives behind these traits: how to recognise replies
//! and acks in raw frames, how to phrase subscribe/unsubscribe requests and
//! how structured payloads become wire bytes. The connection core stays
//! venue-agnostic.

use crate::application::ports::connection_port::CorrelationId;
use crate::application::ports::consumer_port::Envelope;
use crate::domain::frame::{Frame, FrameType};
use crate::domain::subscription::{ChannelSubscription, SubscriptionAck};

/// Payload encoding and decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// `MessagePack` decoding failed.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Payload does not have the shape the venue expects.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// What a venue decoder made of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Subscribe/unsubscribe acknowledgment or rejection.
    Ack(SubscriptionAck),
    /// Market data for a consumer.
    Envelope(Envelope),
}

/// Recognises frames for the dispatcher.
///
/// Both methods must be cheap and must not block; they run inline on the
/// read loop.
pub trait FrameClassifier: Send + Sync {
    /// Extract the correlation id if the frame is a reply to a request.
    fn correlation_id(&self, frame: &Frame) -> Option<CorrelationId>;

    /// Decode an ack or envelope. `None` means the frame is unrecognised.
    fn decode(&self, frame: &Frame) -> Option<Decoded>;
}

/// Builds venue control messages for subscriptions.
pub trait SubscriptionCodec: Send + Sync {
    /// Message requesting a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be expressed for this venue.
    fn subscribe_message(
        &self,
        subscription: &ChannelSubscription,
    ) -> Result<serde_json::Value, CodecError>;

    /// Message cancelling a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be expressed for this venue.
    fn unsubscribe_message(
        &self,
        subscription: &ChannelSubscription,
    ) -> Result<serde_json::Value, CodecError>;
}

/// Turns structured payloads into wire bytes.
pub trait PayloadEncoder: Send + Sync {
    /// Frame type the encoded bytes are sent as.
    fn frame_type(&self) -> FrameType;

    /// Encode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented.
    fn encode(&self, payload: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
}
