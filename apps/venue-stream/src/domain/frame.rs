//! Stream Frames
//!
//! The atomic unit read from or written to a venue connection. A frame is
//! a type tag plus raw bytes; no interpretation happens at this layer.

use std::fmt;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Transport ping control frame.
    Ping,
    /// Transport pong control frame.
    Pong,
    /// Transport close control frame.
    Close,
}

impl FrameType {
    /// Check if this is a transport control frame.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Close)
    }

    /// Get the frame type name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound or outbound unit of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type tag.
    pub frame_type: FrameType,
    /// Raw payload bytes.
    pub raw: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(frame_type: FrameType, raw: Vec<u8>) -> Self {
        Self { frame_type, raw }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameType::Text, text.into().into_bytes())
    }

    /// Create a binary frame.
    #[must_use]
    pub const fn binary(raw: Vec<u8>) -> Self {
        Self::new(FrameType::Binary, raw)
    }

    /// Borrow the payload as UTF-8 text if it is valid.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }

    /// Render the payload as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Check if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_round_trips_utf8() {
        let frame = Frame::text("{\"id\":1}");
        assert_eq!(frame.frame_type, FrameType::Text);
        assert_eq!(frame.as_text(), Some("{\"id\":1}"));
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn binary_frame_lossy_text() {
        let frame = Frame::binary(vec![0x66, 0xff, 0x6f]);
        assert!(frame.as_text().is_none());
        assert_eq!(frame.to_text_lossy(), "f\u{fffd}o");
    }

    #[test]
    fn control_frames() {
        assert!(FrameType::Ping.is_control());
        assert!(FrameType::Pong.is_control());
        assert!(FrameType::Close.is_control());
        assert!(!FrameType::Text.is_control());
        assert!(!FrameType::Binary.is_control());
    }
}
