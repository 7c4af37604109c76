//! Protocol base: message contract, dispatch table and event hooks.
//!
//! A protocol validates multipart messages, parses them into typed
//! protocol messages, owns the per-message-type handler table, and
//! reacts to invalid messages and handler failures. The channel drives
//! it from [`Channel::receive`](crate::channel::Channel::receive).

use hashbrown::HashMap;
use std::hash::Hash;

use crate::channel::ChannelCore;
use crate::error::{Error, Result};
use crate::message::Zmsg;
use crate::session::{Session, SessionStore};
use crate::types::{Direction, Received, RoutingId};

/// Key in a protocol dispatch table.
///
/// Message keys are looked up most-specific first; the wildcard
/// [`DispatchKey::Any`] terminates every key sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchKey<T> {
    /// Key derived from the message (typically its type).
    Exact(T),
    /// Wildcard that matches any message.
    Any,
}

/// Contract for typed protocol messages.
pub trait ProtocolMessage: Clone + Sized + 'static {
    /// Dispatch key type produced by [`keys`](Self::keys).
    type Key: Clone + Eq + Hash + 'static;

    /// Populate a message from multipart frames.
    ///
    /// # Errors
    ///
    /// Returns an invalid-message error when the frames do not form a
    /// valid protocol message.
    fn from_frames(frames: &Zmsg) -> Result<Self>;

    /// Serialize the message to multipart frames.
    fn to_frames(&self) -> Zmsg;

    /// Dispatch lookup keys, most specific first, ending with the
    /// wildcard.
    fn keys(&self) -> Vec<Self::Key>;

    /// Reset the message to its empty state.
    fn clear(&mut self);
}

/// Message handler stored in a [`HandlerMap`].
///
/// Handlers are plain functions over the protocol state; a returned
/// message is passed back to the `receive` caller, `None` means the
/// message was fully consumed.
pub type Handler<P> = fn(
    &mut P,
    &mut ChannelCore,
    &mut SessionStore<<P as Protocol>::Session>,
    &RoutingId,
    &<P as Protocol>::Message,
) -> Result<Option<<P as Protocol>::Message>>;

/// Dispatch table mapping message-derived keys to handlers.
pub struct HandlerMap<P: Protocol> {
    entries: HashMap<<P::Message as ProtocolMessage>::Key, Handler<P>>,
}

impl<P: Protocol> Default for HandlerMap<P> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<P: Protocol> HandlerMap<P> {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`, replacing any previous entry.
    pub fn set(&mut self, key: <P::Message as ProtocolMessage>::Key, handler: Handler<P>) {
        self.entries.insert(key, handler);
    }

    /// Resolve the handler for `msg`.
    ///
    /// Walks [`ProtocolMessage::keys`] in order and returns the first
    /// registered handler, so the most specific key wins and the
    /// wildcard acts as fallback.
    pub fn resolve(&self, msg: &P::Message) -> Option<Handler<P>> {
        msg.keys().into_iter().find_map(|key| self.entries.get(&key).copied())
    }
}

/// Base contract for channel protocols.
///
/// A protocol is owned by exactly one channel; the channel passes its
/// socket-facing state ([`ChannelCore`]) and session store to every
/// hook so handlers can send replies and manage sessions without
/// reaching back into the channel.
pub trait Protocol: Sized + 'static {
    /// Session type attached to peers of this protocol.
    type Session: Session;
    /// Message type of this protocol.
    type Message: ProtocolMessage;

    /// The dispatch table used by [`handle_message`](Self::handle_message).
    fn handlers(&self) -> &HandlerMap<Self>;

    /// Verify that `frames` form a valid protocol message.
    ///
    /// The base implementation performs no validation.
    ///
    /// # Errors
    ///
    /// Returns an invalid-message error on any violation; when this
    /// passes, [`parse`](Self::parse) of the same frames must succeed.
    fn validate(&self, frames: &Zmsg) -> Result<()> {
        let _ = frames;
        Ok(())
    }

    /// Convert `frames` into a protocol message.
    fn parse(&self, frames: &Zmsg) -> Result<Self::Message> {
        Self::Message::from_frames(frames)
    }

    /// Validate an incoming message that would initiate a new session.
    ///
    /// The base implementation accepts unconditionally.
    fn accept_new_session(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
        routing_id: &RoutingId,
        msg: &Self::Message,
    ) -> bool {
        let _ = (channel, sessions, routing_id, msg);
        true
    }

    /// Whether [`Channel::connect`](crate::channel::Channel::connect)
    /// should associate a session with the connected peer.
    ///
    /// Protocols whose connecting peer must send the first message
    /// return true; the base implementation derives the answer from
    /// the channel direction.
    fn connect_with_session(&self, channel: &ChannelCore) -> bool {
        channel.direction().contains(Direction::OUT)
    }

    /// Initialize a freshly created session. The base implementation
    /// does nothing.
    fn initialize_session(&mut self, session: &mut Self::Session) {
        let _ = session;
    }

    /// Process a message received from a peer.
    ///
    /// Resolves the handler through the dispatch table and executes
    /// it. Handler failures are routed to
    /// [`handle_exception`](Self::handle_exception) and reported as
    /// [`Received::Invalid`].
    fn handle_message(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
        routing_id: &RoutingId,
        msg: &Self::Message,
    ) -> Received<Self::Message> {
        let Some(handler) = self.handlers().resolve(msg) else {
            tracing::warn!(channel = channel.name(), "message without handler");
            return Received::Invalid;
        };
        match handler(self, channel, sessions, routing_id, msg) {
            Ok(Some(reply)) => Received::Message(reply),
            Ok(None) => Received::Handled,
            Err(err) => {
                self.handle_exception(channel, sessions, routing_id, msg, &err);
                Received::Invalid
            }
        }
    }

    /// Called when message validation or parsing fails.
    ///
    /// The base implementation logs the failure and drops the message.
    fn handle_invalid_message(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
        routing_id: Option<&RoutingId>,
        err: &Error,
    ) {
        let _ = (sessions, routing_id);
        tracing::debug!(channel = channel.name(), error = %err, "invalid message dropped");
    }

    /// Called when a message handler fails.
    ///
    /// The base implementation logs the failure. Implementations that
    /// send wire-level errors here must swallow their own failures so
    /// the session teardown still happens.
    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
        routing_id: &RoutingId,
        msg: &Self::Message,
        err: &Error,
    ) {
        let _ = (sessions, routing_id, msg);
        tracing::debug!(channel = channel.name(), error = %err, "message handler failed");
    }

    /// Called when the channel is ready to accept at least one
    /// outgoing message without blocking.
    fn handle_output_ready(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
    ) -> Result<()> {
        let _ = (channel, sessions);
        Ok(())
    }

    /// Called when a send fails with `EAGAIN`. Returning true tells
    /// the channel to treat the send as deferred rather than failed.
    fn on_send_later(
        &mut self,
        channel: &mut ChannelCore,
        routing_id: &RoutingId,
        msg: &Self::Message,
    ) -> bool {
        let _ = (channel, routing_id, msg);
        false
    }

    /// Called when a send fails with a hard ZMQ error. Returning true
    /// tells the channel to ignore the failure.
    fn on_send_failed(
        &mut self,
        channel: &mut ChannelCore,
        routing_id: &RoutingId,
        msg: &Self::Message,
        err: &zmq::Error,
    ) -> bool {
        let _ = (channel, routing_id, msg, err);
        false
    }

    /// Called when a receive fails with `EAGAIN`. Returning true turns
    /// the failure into [`Received::Invalid`] instead of an error.
    fn on_receive_later(&mut self, channel: &mut ChannelCore) -> bool {
        let _ = channel;
        false
    }

    /// Called when a receive fails with a hard ZMQ error. Returning
    /// true turns the failure into [`Received::Invalid`].
    fn on_receive_failed(&mut self, channel: &mut ChannelCore, err: &zmq::Error) -> bool {
        let _ = (channel, err);
        false
    }

    /// Called by the manager before the channel is shut down. All
    /// failures inside are ignored by the caller.
    fn on_shutdown(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<Self::Session>,
        forced: bool,
    ) {
        let _ = (channel, sessions, forced);
    }
}

/// Discard a session, disconnecting any endpoint bound to it.
///
/// Shared by protocol handlers which only hold the channel core and
/// the session store.
pub fn discard_session<S: Session>(
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<S>,
    routing_id: &RoutingId,
) -> Option<S> {
    let session = sessions.remove(routing_id)?;
    if let Some(endpoint) = session.endpoint() {
        if let Err(err) = channel.disconnect_endpoint(Some(endpoint)) {
            tracing::debug!(
                channel = channel.name(),
                endpoint = %endpoint,
                error = %err,
                "disconnect on session discard failed"
            );
        }
    }
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SimpleMessage;
    use crate::session::SessionBase;
    use bytes::Bytes;

    struct ToyProtocol {
        handlers: HandlerMap<ToyProtocol>,
        hits: Vec<&'static str>,
    }

    impl ToyProtocol {
        fn new() -> Self {
            Self { handlers: HandlerMap::new(), hits: Vec::new() }
        }

        fn on_exact(
            proto: &mut Self,
            _chn: &mut ChannelCore,
            _sessions: &mut SessionStore<SessionBase>,
            _rid: &RoutingId,
            _msg: &SimpleMessage,
        ) -> Result<Option<SimpleMessage>> {
            proto.hits.push("exact");
            Ok(None)
        }

        fn on_any(
            proto: &mut Self,
            _chn: &mut ChannelCore,
            _sessions: &mut SessionStore<SessionBase>,
            _rid: &RoutingId,
            msg: &SimpleMessage,
        ) -> Result<Option<SimpleMessage>> {
            proto.hits.push("any");
            Ok(Some(msg.clone()))
        }
    }

    impl Protocol for ToyProtocol {
        type Session = SessionBase;
        type Message = SimpleMessage;

        fn handlers(&self) -> &HandlerMap<Self> {
            &self.handlers
        }
    }

    fn frame_key(data: &'static [u8]) -> DispatchKey<Bytes> {
        DispatchKey::Exact(Bytes::from_static(data))
    }

    #[test]
    fn test_most_specific_key_wins() {
        let mut proto = ToyProtocol::new();
        proto.handlers.set(frame_key(b"ping"), ToyProtocol::on_exact);
        proto.handlers.set(DispatchKey::Any, ToyProtocol::on_any);

        let msg = SimpleMessage::from_frame(&b"ping"[..]);
        let handler = proto.handlers.resolve(&msg).unwrap();
        let mut chn = ChannelCore::for_tests("toy");
        let mut sessions = SessionStore::new();
        handler(&mut proto, &mut chn, &mut sessions, &RoutingId::internal(), &msg).unwrap();
        assert_eq!(proto.hits, vec!["exact"]);
    }

    #[test]
    fn test_wildcard_fallback() {
        let mut proto = ToyProtocol::new();
        proto.handlers.set(frame_key(b"ping"), ToyProtocol::on_exact);
        proto.handlers.set(DispatchKey::Any, ToyProtocol::on_any);

        let msg = SimpleMessage::from_frame(&b"other"[..]);
        let handler = proto.handlers.resolve(&msg).unwrap();
        let mut chn = ChannelCore::for_tests("toy");
        let mut sessions = SessionStore::new();
        let reply = handler(&mut proto, &mut chn, &mut sessions, &RoutingId::internal(), &msg)
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(proto.hits, vec!["any"]);
    }

    #[test]
    fn test_no_handler_resolves_none() {
        let proto = ToyProtocol::new();
        let msg = SimpleMessage::from_frame(&b"ping"[..]);
        assert!(proto.handlers.resolve(&msg).is_none());
    }
}
