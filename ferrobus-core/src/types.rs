//! Shared type definitions for the Ferrobus messaging kernel.
//!
//! This module provides the socket/transmission enums, peer and agent
//! descriptors, and the platform identity constants used across the
//! channel, protocol and component layers.

use std::fmt;

use bytes::Bytes;
use hashbrown::HashMap;
use uuid::{uuid, Uuid};

use crate::endpoint::ZmqAddress;

/// Platform identity.
pub const PLATFORM_UID: Uuid = uuid!("d8e453b7-9b28-4e3f-b6a5-3a2c9e1d7f40");
/// Platform version (semver).
pub const PLATFORM_VERSION: &str = "0.1.0";
/// Platform vendor identity.
pub const VENDOR_UID: Uuid = uuid!("22b42b28-6f34-4d14-8b3e-7c9a5d0e1f62");

/// MIME type for plain text pipe data.
pub const MIME_TYPE_TEXT: &str = "text/plain";
/// MIME type for raw binary pipe data.
pub const MIME_TYPE_BINARY: &str = "application/octet-stream";
/// MIME type for MessagePack-encoded dataframes.
pub const MIME_TYPE_MSGPACK: &str = "application/x-msgpack";

/// ZeroMQ socket types used by channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// DEALER socket for asynchronous request-reply patterns
    Dealer,
    /// ROUTER socket for routing messages by peer identity
    Router,
    /// PUB socket for publishing messages to subscribers
    Pub,
    /// SUB socket for subscribing to published messages
    Sub,
    /// XPUB socket for extended publishing with subscription awareness
    XPub,
    /// XSUB socket for extended subscribing with dynamic subscriptions
    XSub,
    /// PUSH socket for distributing messages to pullers
    Push,
    /// PULL socket for receiving messages from pushers
    Pull,
    /// PAIR socket for exclusive bidirectional communication
    Pair,
}

impl SocketKind {
    /// Get the socket kind as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::XPub => "XPUB",
            Self::XSub => "XSUB",
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::Pair => "PAIR",
        }
    }

    /// Directions of transmission this socket kind supports.
    pub fn direction(&self) -> Direction {
        match self {
            Self::Push | Self::Pub => Direction::OUT,
            Self::Pull | Self::Sub | Self::XSub => Direction::IN,
            _ => Direction::BOTH,
        }
    }

    /// Whether peers on this socket are addressed by routing ID.
    pub fn routed(&self) -> bool {
        matches!(self, Self::Router)
    }

    /// The corresponding `zmq` socket type.
    pub fn to_zmq(self) -> zmq::SocketType {
        match self {
            Self::Dealer => zmq::DEALER,
            Self::Router => zmq::ROUTER,
            Self::Pub => zmq::PUB,
            Self::Sub => zmq::SUB,
            Self::XPub => zmq::XPUB,
            Self::XSub => zmq::XSUB,
            Self::Push => zmq::PUSH,
            Self::Pull => zmq::PULL,
            Self::Pair => zmq::PAIR,
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// ZeroMQ socket mode.
///
/// Transitions `Unknown → Bind` on first bind, `Unknown → Connect` on
/// first connect, and back to `Unknown` when the last endpoint is
/// released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SocketMode {
    /// No endpoint open yet.
    #[default]
    Unknown,
    /// Channel binds its endpoints.
    Bind,
    /// Channel connects to remote endpoints.
    Connect,
}

/// Direction(s) of transmission over a channel.
///
/// A small bit set aligned with `POLLIN`/`POLLOUT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Direction(u8);

impl Direction {
    /// No transmission.
    pub const NONE: Direction = Direction(0);
    /// Incoming transmission.
    pub const IN: Direction = Direction(1);
    /// Outgoing transmission.
    pub const OUT: Direction = Direction(2);
    /// Transmission in both directions.
    pub const BOTH: Direction = Direction(3);

    /// Returns true if all directions in `other` are present in `self`.
    pub fn contains(self, other: Direction) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if no direction is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set of directions present in both `self` and `other`.
    pub fn intersection(self, other: Direction) -> Direction {
        Direction(self.0 & other.0)
    }

    /// `self` with all directions in `other` removed.
    pub fn without(self, other: Direction) -> Direction {
        Direction(self.0 & !other.0)
    }

    /// The poll event set corresponding to this direction.
    pub fn to_poll_events(self) -> zmq::PollEvents {
        let mut events = zmq::PollEvents::empty();
        if self.contains(Direction::IN) {
            events |= zmq::POLLIN;
        }
        if self.contains(Direction::OUT) {
            events |= zmq::POLLOUT;
        }
        events
    }

    /// Direction observed in a poll event set.
    pub fn from_poll_events(events: zmq::PollEvents) -> Direction {
        let mut dir = Direction::NONE;
        if events.contains(zmq::POLLIN) {
            dir |= Direction::IN;
        }
        if events.contains(zmq::POLLOUT) {
            dir |= Direction::OUT;
        }
        dir
    }
}

impl std::ops::BitOr for Direction {
    type Output = Direction;
    fn bitor(self, rhs: Direction) -> Direction {
        Direction(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Direction {
    fn bitor_assign(&mut self, rhs: Direction) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Direction::NONE => "NONE",
            Direction::IN => "IN",
            Direction::OUT => "OUT",
            _ => "BOTH",
        };
        write!(f, "{s}")
    }
}

/// Origin of a received message in protocol context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Origin not determined.
    Unknown,
    /// Message sent by the service side.
    Service,
    /// Message sent by the client side.
    Client,
    /// Any origin.
    Any,
}

impl Origin {
    /// Alias for data-pipe contexts: the producing side.
    pub const PROVIDER: Origin = Origin::Service;
    /// Alias for data-pipe contexts: the consuming side.
    pub const CONSUMER: Origin = Origin::Client;

    /// The role of the communication partner.
    pub fn peer_role(self) -> Origin {
        match self {
            Origin::Service => Origin::Client,
            Origin::Client => Origin::Service,
            other => other,
        }
    }
}

/// Data-pipe socket identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipeSocket {
    /// Server socket that consumes data.
    Input = 1,
    /// Server socket that produces data.
    Output = 2,
}

impl PipeSocket {
    /// Decode from wire value; zero and unknown values are rejected.
    pub fn from_wire(value: u8) -> Option<PipeSocket> {
        match value {
            1 => Some(PipeSocket::Input),
            2 => Some(PipeSocket::Output),
            _ => None,
        }
    }

    /// The socket a peer must attach to when this side uses `self`.
    pub fn peer(self) -> PipeSocket {
        match self {
            PipeSocket::Input => PipeSocket::Output,
            PipeSocket::Output => PipeSocket::Input,
        }
    }

    /// Get the pipe socket as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeSocket::Input => "INPUT",
            PipeSocket::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for PipeSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// General component/service state information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum State {
    /// State not determined.
    #[default]
    Unknown = 0,
    /// Component is initialized and ready to run.
    Ready = 1,
    /// Component event loop is running.
    Running = 2,
    /// Component is waiting (blocked).
    Waiting = 3,
    /// Component is suspended (stopped).
    Suspended = 4,
    /// Component finished gracefully.
    Finished = 5,
    /// Component terminated on unhandled error.
    Aborted = 6,
}

impl State {
    /// Lifecycle alias: a freshly created component is `Ready`.
    pub const CREATED: State = State::Ready;
    /// Lifecycle alias: a stopped component is `Suspended`.
    pub const STOPPED: State = State::Suspended;

    /// Decode from wire value.
    pub fn from_wire(value: u16) -> Option<State> {
        Some(match value {
            0 => State::Unknown,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Waiting,
            4 => State::Suspended,
            5 => State::Finished,
            6 => State::Aborted,
            _ => return None,
        })
    }
}

/// Terminal status of a component run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Run did not finish yet, or status was lost.
    #[default]
    Unknown,
    /// Run finished without error.
    Ok,
    /// Run finished with an error.
    Error,
}

impl Outcome {
    /// Get the outcome as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Unknown => "UNKNOWN",
            Outcome::Ok => "OK",
            Outcome::Error => "ERROR",
        }
    }

    /// Decode from the wire string.
    pub fn from_wire(value: &str) -> Option<Outcome> {
        match value {
            "UNKNOWN" => Some(Outcome::Unknown),
            "OK" => Some(Outcome::Ok),
            "ERROR" => Some(Outcome::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque binary identity of a peer on a routed socket.
///
/// Stable for the lifetime of a session.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoutingId(Bytes);

impl RoutingId {
    /// Routing ID used for the single implicit peer of unrouted channels.
    pub fn internal() -> RoutingId {
        RoutingId(Bytes::from_static(b"INTERNAL"))
    }

    /// A freshly generated unique routing ID.
    pub fn generate() -> RoutingId {
        RoutingId(Bytes::from(Uuid::new_v4().simple().to_string().into_bytes()))
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for RoutingId {
    fn from(value: &[u8]) -> Self {
        RoutingId(Bytes::copy_from_slice(value))
    }
}

impl From<Bytes> for RoutingId {
    fn from(value: Bytes) -> Self {
        RoutingId(value)
    }
}

impl fmt::Debug for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingId({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Name/value supplement attached to peer and agent descriptors.
pub type Supplement = HashMap<String, String>;

/// Mapping of channel names to the addresses actually bound.
///
/// Populated after bind; wildcard ports are resolved.
pub type EndpointMap = HashMap<String, Vec<ZmqAddress>>;

/// Peer descriptor: identity of one running component instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDescriptor {
    /// Peer ID.
    pub uid: Uuid,
    /// Peer process ID.
    pub pid: u32,
    /// Host name.
    pub host: String,
    /// Optional supplemental information.
    pub supplement: Option<Supplement>,
}

impl PeerDescriptor {
    /// Descriptor for a peer running in this process.
    pub fn new(uid: Uuid) -> PeerDescriptor {
        PeerDescriptor {
            uid,
            pid: std::process::id(),
            host: hostname(),
            supplement: None,
        }
    }
}

/// Agent descriptor: identity of a service or client implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDescriptor {
    /// Agent ID.
    pub uid: Uuid,
    /// Agent name.
    pub name: String,
    /// Agent version string.
    pub version: String,
    /// Vendor ID.
    pub vendor_uid: Uuid,
    /// Agent classification string.
    pub classification: String,
    /// Platform ID.
    pub platform_uid: Uuid,
    /// Platform version string.
    pub platform_version: String,
    /// Optional supplemental information.
    pub supplement: Option<Supplement>,
}

impl AgentDescriptor {
    /// Descriptor with platform identity filled from the constants.
    pub fn new(uid: Uuid, name: &str, version: &str, vendor_uid: Uuid,
               classification: &str) -> AgentDescriptor {
        AgentDescriptor {
            uid,
            name: name.to_string(),
            version: version.to_string(),
            vendor_uid,
            classification: classification.to_string(),
            platform_uid: PLATFORM_UID,
            platform_version: PLATFORM_VERSION.to_string(),
            supplement: None,
        }
    }
}

/// One service API interface enumeration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Interface ID.
    pub uid: Uuid,
    /// Interface name.
    pub name: String,
}

/// Service descriptor.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Service agent descriptor.
    pub agent: AgentDescriptor,
    /// Service API interfaces, empty for plain microservices.
    pub api: Vec<InterfaceDescriptor>,
    /// Text describing the service.
    pub description: String,
    /// Facility tags this service uses.
    pub facilities: Vec<String>,
    /// Locator string for the component factory.
    pub factory: String,
    /// Locator string for the configuration factory.
    pub config_factory: String,
}

/// Outcome of a protocol-level receive operation.
#[derive(Debug)]
pub enum Received<M> {
    /// A valid message that the protocol handler passed back to the caller.
    Message(M),
    /// A valid message fully consumed by the protocol handler.
    Handled,
    /// Message was not a valid protocol message, the session was refused,
    /// or the handler failed.
    Invalid,
    /// No message arrived within the receive timeout.
    Timeout,
}

impl<M> Received<M> {
    /// Returns true for the timeout sentinel.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Received::Timeout)
    }

    /// Returns true for the invalid sentinel.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Received::Invalid)
    }

    /// The message passed back by the handler, if any.
    pub fn into_message(self) -> Option<M> {
        match self {
            Received::Message(m) => Some(m),
            _ => None,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_kind_direction() {
        assert_eq!(SocketKind::Push.direction(), Direction::OUT);
        assert_eq!(SocketKind::Pull.direction(), Direction::IN);
        assert_eq!(SocketKind::Sub.direction(), Direction::IN);
        assert_eq!(SocketKind::XSub.direction(), Direction::IN);
        assert_eq!(SocketKind::Dealer.direction(), Direction::BOTH);
        assert_eq!(SocketKind::XPub.direction(), Direction::BOTH);
        assert!(SocketKind::Router.routed());
        assert!(!SocketKind::Dealer.routed());
    }

    #[test]
    fn test_direction_ops() {
        assert!(Direction::BOTH.contains(Direction::IN));
        assert!(Direction::BOTH.contains(Direction::OUT));
        assert!(!Direction::IN.contains(Direction::OUT));
        assert!(Direction::NONE.is_empty());
        assert_eq!(Direction::IN | Direction::OUT, Direction::BOTH);
        assert_eq!(Direction::BOTH.without(Direction::OUT), Direction::IN);
        assert_eq!(Direction::IN.intersection(Direction::BOTH), Direction::IN);
    }

    #[test]
    fn test_direction_poll_events_roundtrip() {
        for dir in [Direction::NONE, Direction::IN, Direction::OUT, Direction::BOTH] {
            assert_eq!(Direction::from_poll_events(dir.to_poll_events()), dir);
        }
    }

    #[test]
    fn test_origin_peer_role() {
        assert_eq!(Origin::Service.peer_role(), Origin::Client);
        assert_eq!(Origin::Client.peer_role(), Origin::Service);
        assert_eq!(Origin::Any.peer_role(), Origin::Any);
        assert_eq!(Origin::PROVIDER, Origin::Service);
    }

    #[test]
    fn test_pipe_socket_wire() {
        assert_eq!(PipeSocket::from_wire(1), Some(PipeSocket::Input));
        assert_eq!(PipeSocket::from_wire(2), Some(PipeSocket::Output));
        assert_eq!(PipeSocket::from_wire(0), None);
        assert_eq!(PipeSocket::Input.peer(), PipeSocket::Output);
    }

    #[test]
    fn test_outcome_wire_strings() {
        assert_eq!(Outcome::Ok.as_str(), "OK");
        assert_eq!(Outcome::from_wire("ERROR"), Some(Outcome::Error));
        assert_eq!(Outcome::from_wire("bogus"), None);
    }

    #[test]
    fn test_routing_id() {
        let internal = RoutingId::internal();
        assert_eq!(internal.as_bytes(), b"INTERNAL");
        let a = RoutingId::generate();
        let b = RoutingId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_aliases() {
        assert_eq!(State::CREATED, State::Ready);
        assert_eq!(State::STOPPED, State::Suspended);
        assert_eq!(State::from_wire(5), Some(State::Finished));
        assert_eq!(State::from_wire(99), None);
    }
}
