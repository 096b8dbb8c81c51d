//! Error types for the gateway client.
//!
//! Every variant carries owned strings rather than source errors so that a
//! single connect outcome can be cloned out to all concurrent `connect()`
//! callers.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the client engine.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failure to turn an incoming frame into an envelope.
///
/// Decode failures never reach callers of `connect()` or `request()`: the
/// connection task logs them and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame was not a valid JSON document of the expected shape.
    #[error("malformed frame: {0}")]
    Json(String),

    /// The `type` discriminator named something other than `req`, `res` or `event`.
    #[error("unrecognized envelope type `{0}`")]
    UnknownType(String),
}

/// Errors surfaced by the gateway client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Socket-level failure before the connection reached `Open`.
    #[error("transport error: {0}")]
    Transport(String),

    /// The gateway answered a request with `ok: false`.
    #[error("{message}")]
    Protocol { message: String },

    /// An outbound write was attempted while the transport was not open.
    #[error("cannot send, socket not open")]
    NotReady,

    /// No response arrived within the configured request timeout.
    #[error("request `{method}` timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The connection closed while the operation was still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A successful response body did not have the shape the caller asked for.
    #[error("unexpected response body for `{method}`: {reason}")]
    UnexpectedBody { method: String, reason: String },

    /// An outbound envelope could not be serialized.
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),

    /// The client configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Default message used when the gateway rejects a request without one.
    pub const UNKNOWN_PROTOCOL_ERROR: &'static str = "Unknown error";

    /// Build a protocol error from the optional server-supplied message.
    pub fn protocol(message: Option<String>) -> Self {
        Self::Protocol {
            message: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| Self::UNKNOWN_PROTOCOL_ERROR.to_string()),
        }
    }
}
