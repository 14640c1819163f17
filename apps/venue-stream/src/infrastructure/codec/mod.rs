//! Payload Encoders
//!
//! Structured payloads are encoded once, on the send path, by the encoder the
//! connection was built with.
//!
//! - **`JsonEncoder`**: UTF-8 JSON sent as text frames (most venues)
//! - **`MsgPackEncoder`**: `MessagePack` sent as binary frames

use crate::application::ports::PayloadEncoder;
use crate::domain::frame::FrameType;

pub use crate::application::ports::CodecError;

/// JSON encoder producing text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl JsonEncoder {
    /// Create a new JSON encoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PayloadEncoder for JsonEncoder {
    fn frame_type(&self) -> FrameType {
        FrameType::Text
    }

    fn encode(&self, payload: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(payload)?)
    }
}

/// `MessagePack` encoder producing binary frames.
///
/// Maps are encoded with field names so venues can decode them as objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackEncoder;

impl MsgPackEncoder {
    /// Create a new `MessagePack` encoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a `MessagePack` payload back into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid `MessagePack`.
    pub fn decode(&self, data: &[u8]) -> Result<serde_json::Value, CodecError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

impl PayloadEncoder for MsgPackEncoder {
    fn frame_type(&self) -> FrameType {
        FrameType::Binary
    }

    fn encode(&self, payload: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(payload)?)
    }
}
