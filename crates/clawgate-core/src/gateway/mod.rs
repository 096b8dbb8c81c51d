//! Gateway protocol engine.
//!
//! Data flows transport → codec → {dispatcher | correlator}, all driven by
//! the lifecycle manager in [`client`], which also owns the outbound sender.

pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod protocol;
pub mod sender;
pub mod transport;

pub use client::{ConnectionState, GatewayClient};
pub use correlator::{PendingRequests, Reply, Settled};
pub use dispatcher::{EventHandler, Subscription, SubscriptionRegistry};
pub use protocol::{Envelope, EventFrame, RawFrame, RequestFrame, ResponseFrame};
pub use sender::OutboundSender;
pub use transport::{
    Connector, MemoryConnector, MemoryGateway, MemoryPeer, TransportEvent, TransportLink,
    WebSocketConnector,
};
