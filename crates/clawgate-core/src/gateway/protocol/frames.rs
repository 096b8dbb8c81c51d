//! Envelope types for the gateway wire protocol.
//!
//! Every frame on the wire is one JSON document with a `type` discriminator:
//!
//! ```text
//! {"type":"req",   "id", "method", "params"}          client -> gateway
//! {"type":"res",   "id", "ok", "body"?, "error"?}     gateway -> client
//! {"type":"event", "event", "payload"}                gateway -> client
//! ```
//!
//! The handshake is an ordinary `req` with method `connect`, sent in answer
//! to the gateway-initiated `connect.challenge` event.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Reserved event the gateway sends to start the handshake.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Role requested during the handshake unless configured otherwise.
pub const DEFAULT_ROLE: &str = "operator";

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Envelope {
    /// Wire name of the envelope's `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "req",
            Self::Response(_) => "res",
            Self::Event(_) => "event",
        }
    }

    /// Shorthand for an outbound request envelope.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Whether this is the gateway's handshake challenge.
    pub fn is_connect_challenge(&self) -> bool {
        matches!(self, Self::Event(ev) if ev.is_connect_challenge())
    }
}

/// Outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Gateway answer to a [`RequestFrame`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Some gateway builds put the result here instead of in `body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_error"
    )]
    pub error: Option<ResponseError>,
}

impl ResponseFrame {
    /// A successful response carrying `body`.
    pub fn success(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            body: Some(body),
            payload: None,
            error: None,
        }
    }

    /// A failed response carrying `message`.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            body: None,
            payload: None,
            error: Some(ResponseError {
                message: Some(Value::String(message.into())),
                code: None,
            }),
        }
    }

    /// Collapse the response into the value a caller sees.
    ///
    /// `body` wins over `payload`; a successful response with neither
    /// resolves to `null`.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        if self.ok {
            Ok(self.body.or(self.payload).unwrap_or(Value::Null))
        } else {
            let message = self.error.as_ref().and_then(ResponseError::message);
            Err(GatewayError::protocol(message.map(str::to_owned)))
        }
    }
}

/// Error object attached to a failed response.
///
/// Gateways disagree on field types (`code` may be a number or a string), so
/// both fields are kept as raw JSON and only a string `message` is surfaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

impl ResponseError {
    /// The server's message, if it sent a non-empty string.
    pub fn message(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
    }
}

/// Accept any JSON for `error`; anything other than an object carries no
/// usable message.
fn lenient_error<'de, D>(deserializer: D) -> Result<Option<ResponseError>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|value| match value {
        Value::Object(mut fields) => ResponseError {
            message: fields.remove("message"),
            code: fields.remove("code"),
        },
        _ => ResponseError::default(),
    }))
}

/// Server-pushed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn is_connect_challenge(&self) -> bool {
        self.event == CONNECT_CHALLENGE_EVENT
    }
}

// ── Handshake ───────────────────────────────────────────────────────────────

/// Inclusive protocol version bounds declared in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRange {
    pub min: u32,
    pub max: u32,
}

impl Default for ProtocolRange {
    fn default() -> Self {
        Self::pinned(PROTOCOL_VERSION)
    }
}

impl ProtocolRange {
    /// Exactly one version.
    pub fn pinned(version: u32) -> Self {
        Self {
            min: version,
            max: version,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

/// `params` of the `connect` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub role: String,
    pub client: ClientInfo,
    pub auth: AuthParams,
}

/// Client-identity descriptor sent during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub device_family: String,
}

/// Bearer credentials sent during the handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

impl std::fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthParams").field("token", &"***").finish()
    }
}
