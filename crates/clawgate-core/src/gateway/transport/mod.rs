//! Transport adapters: one persistent duplex connection per link.
//!
//! A [`Connector`] opens a [`TransportLink`]. Returning from
//! [`Connector::open`] is the "open" signal; after that the link yields
//! inbound frames, errors and the final close on one ordered channel.
//! Adapters never reconnect and give no delivery guarantee.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::protocol::RawFrame;
use crate::error::GatewayError;

pub use memory::{MemoryConnector, MemoryGateway, MemoryPeer};
pub use websocket::WebSocketConnector;

/// Something that happened on an open link, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(RawFrame),
    Error(String),
    /// Terminal. Nothing follows it.
    Closed,
}

/// Opens transport links to a gateway.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one connection to `url`, presenting `origin` to the gateway's
    /// access check.
    async fn open(&self, url: &str, origin: &str) -> Result<TransportLink, GatewayError>;
}

/// The client's end of one open connection.
///
/// Dropping the link tears the connection down.
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    _shutdown: Option<DropGuard>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            events,
            _shutdown: None,
        }
    }

    /// Cancel `token` when this link is dropped.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self._shutdown = Some(token.drop_guard());
        self
    }

    /// A handle for writing serialized envelopes to the connection.
    pub fn writer(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Next inbound event; `None` once the adapter is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}
