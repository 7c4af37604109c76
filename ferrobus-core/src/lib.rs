//! Ferrobus Core
//!
//! This crate contains the protocol-agnostic messaging kernel of the
//! Ferrobus service platform:
//! - Shared enums, descriptors and sentinels (`types`)
//! - Endpoint addresses with domain classification (`endpoint`)
//! - Error taxonomy (`error`)
//! - Multipart message primitives (`message`)
//! - Peer sessions and session stores (`session`)
//! - Protocol base with keyed dispatch (`protocol`)
//! - Channels over ZeroMQ sockets (`channel`)
//! - The channel manager with its unified poll (`manager`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod session;
pub mod types;

// A small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelConfig, ChannelCore, ManagedChannel, SocketOptions};
    pub use crate::endpoint::{Domain, ZmqAddress};
    pub use crate::error::{Error, Result};
    pub use crate::manager::ChannelManager;
    pub use crate::message::{SimpleMessage, Zmsg};
    pub use crate::protocol::{DispatchKey, Handler, HandlerMap, Protocol, ProtocolMessage};
    pub use crate::session::{Session, SessionBase, SessionStore};
    pub use crate::types::{
        Direction, EndpointMap, Origin, Outcome, PeerDescriptor, PipeSocket, Received, RoutingId,
        SocketKind, SocketMode, State,
    };
}
