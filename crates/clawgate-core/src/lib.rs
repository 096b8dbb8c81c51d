//! Client engine for the OpenClaw gateway.
//!
//! [`GatewayClient`] keeps one persistent WebSocket to the gateway, answers
//! its `connect.challenge` with a handshake, correlates requests with their
//! responses and fans server-pushed events out to subscribers.
//!
//! ```rust,ignore
//! use clawgate_core::{ClientConfig, GatewayClient};
//! use serde_json::json;
//!
//! let client = GatewayClient::new(ClientConfig::resolve(None)?)?;
//! let _sub = client.subscribe("chat.message", |payload| println!("{payload}"));
//! let sessions = client.request("sessions.list", json!({})).await?;
//! client.close();
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod retry;

pub use config::{ClientConfig, ClientIdentity};
pub use error::{DecodeError, GatewayError, Result};
pub use gateway::{ConnectionState, GatewayClient, Subscription};
pub use retry::RetryPolicy;
