//! Gateway wire protocol: JSON envelopes and the frame codec.

pub mod codec;
pub mod frames;

pub use codec::{RawFrame, decode, encode};
pub use frames::{
    AuthParams, CONNECT_CHALLENGE_EVENT, CONNECT_METHOD, ClientInfo, ConnectParams, DEFAULT_ROLE,
    Envelope, EventFrame, PROTOCOL_VERSION, ProtocolRange, RequestFrame, ResponseError,
    ResponseFrame,
};
