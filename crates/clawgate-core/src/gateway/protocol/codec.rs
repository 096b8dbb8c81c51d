//! Frame decoding and encoding.
//!
//! Gateways (and proxies in front of them) are inconsistent about whether a
//! JSON document arrives as a text frame or a binary one, and some transports
//! deliver a message as a list of fragments. All of them decode to the same
//! [`Envelope`].

use bytes::Bytes;
use serde_json::Value;

use super::frames::Envelope;
use crate::error::{DecodeError, GatewayError};

/// One inbound frame as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// UTF-8 text frame.
    Text(String),
    /// A single owned binary buffer.
    Buffer(Vec<u8>),
    /// A raw, reference-counted binary block.
    Block(Bytes),
    /// Ordered binary fragments of one document.
    Chunks(Vec<Bytes>),
}

impl RawFrame {
    /// Length of the frame's document in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Buffer(b) => b.len(),
            Self::Block(b) => b.len(),
            Self::Chunks(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for RawFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(buf: Vec<u8>) -> Self {
        Self::Buffer(buf)
    }
}

impl From<Bytes> for RawFrame {
    fn from(block: Bytes) -> Self {
        Self::Block(block)
    }
}

/// Decode one frame into an envelope.
pub fn decode(frame: &RawFrame) -> Result<Envelope, DecodeError> {
    match frame {
        RawFrame::Text(text) => decode_slice(text.as_bytes()),
        RawFrame::Buffer(buf) => decode_slice(buf),
        RawFrame::Block(block) => decode_slice(block),
        RawFrame::Chunks(chunks) => {
            let mut joined = Vec::with_capacity(frame.len());
            for chunk in chunks {
                joined.extend_from_slice(chunk);
            }
            decode_slice(&joined)
        }
    }
}

fn decode_slice(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))?;

    // Classify first so an unknown discriminator is reported as such rather
    // than as a generic shape mismatch.
    match value.get("type").and_then(Value::as_str) {
        Some("req" | "res" | "event") => {}
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
        None => return Err(DecodeError::Json("missing `type` field".into())),
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Json(e.to_string()))
}

/// Serialize an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> Result<String, GatewayError> {
    serde_json::to_string(envelope).map_err(|e| GatewayError::Serialize(e.to_string()))
}
