//! Communication channels over ZeroMQ sockets.
//!
//! A [`Channel`] pairs one ZeroMQ socket with a protocol instance and
//! the sessions of its peers. The socket-facing state lives in
//! [`ChannelCore`], which is what protocol handlers receive so they
//! can send replies and manage endpoints while the channel drives
//! dispatch.

use bytes::Bytes;

use crate::endpoint::ZmqAddress;
use crate::error::{Error, Result};
use crate::message::Zmsg;
use crate::protocol::{discard_session, Protocol, ProtocolMessage};
use crate::session::{Session, SessionStore};
use crate::types::{Direction, Received, RoutingId, SocketKind, SocketMode};

/// Extra socket options applied at warm-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// Receive high-water mark.
    pub rcvhwm: Option<i32>,
    /// Send high-water mark.
    pub sndhwm: Option<i32>,
}

/// Channel creation parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Socket identity (routing ID announced to peers); generated when
    /// not provided.
    pub routing_id: Option<RoutingId>,
    /// Directions initially watched by the manager's unified wait.
    pub wait_for: Direction,
    /// Timeout for send operations in milliseconds (`-1` = infinite).
    pub snd_timeout: i32,
    /// Timeout for receive operations in milliseconds (`-1` = infinite).
    pub rcv_timeout: i32,
    /// Socket linger period in milliseconds.
    pub linger: i32,
    /// Extra socket options.
    pub sock_opts: SocketOptions,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            routing_id: None,
            wait_for: Direction::NONE,
            snd_timeout: 100,
            rcv_timeout: 100,
            linger: 5000,
            sock_opts: SocketOptions::default(),
        }
    }
}

impl ChannelConfig {
    /// Configuration watching the given directions.
    pub fn wait_for(direction: Direction) -> Self {
        Self { wait_for: direction, ..Self::default() }
    }

    /// Set high-water marks for both directions.
    pub fn with_hwm(mut self, rcvhwm: i32, sndhwm: i32) -> Self {
        self.sock_opts.rcvhwm = Some(rcvhwm);
        self.sock_opts.sndhwm = Some(sndhwm);
        self
    }
}

/// Socket-facing state of a channel.
///
/// Owns the ZeroMQ socket (created lazily at warm-up), the endpoint
/// list, the mode, and the transmission direction bookkeeping.
pub struct ChannelCore {
    name: String,
    kind: SocketKind,
    mode: SocketMode,
    direction: Direction,
    wait_for: Direction,
    routed: bool,
    routing_id: RoutingId,
    snd_timeout: i32,
    rcv_timeout: i32,
    linger: i32,
    sock_opts: SocketOptions,
    endpoints: Vec<ZmqAddress>,
    socket: Option<zmq::Socket>,
}

impl ChannelCore {
    fn new(name: &str, kind: SocketKind, config: ChannelConfig) -> Result<Self> {
        let wait_for = config.wait_for;
        if !kind.direction().contains(wait_for) {
            return Err(Error::channel(format!(
                "channel '{name}' cannot wait for {wait_for} on {kind} socket"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            mode: SocketMode::Unknown,
            direction: kind.direction(),
            wait_for,
            routed: kind.routed(),
            routing_id: config.routing_id.unwrap_or_else(RoutingId::generate),
            snd_timeout: config.snd_timeout,
            rcv_timeout: config.rcv_timeout,
            linger: config.linger,
            sock_opts: config.sock_opts,
            endpoints: Vec::new(),
            socket: None,
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ZMQ socket kind this channel uses.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// ZMQ socket mode.
    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    /// Possible directions of transmission over this channel.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Directions currently watched by the unified wait.
    pub fn wait_for(&self) -> Direction {
        self.wait_for
    }

    /// Replace the watched direction set.
    ///
    /// # Errors
    ///
    /// Returns a channel error when `value` contains a direction the
    /// channel does not support.
    pub fn set_wait_for(&mut self, value: Direction) -> Result<()> {
        if !self.direction.contains(value) {
            return Err(Error::channel(
                "cannot wait for events in direction not supported by channel",
            ));
        }
        self.wait_for = value;
        Ok(())
    }

    /// Set or clear `IN` in the watched direction set.
    pub fn set_wait_in(&mut self, value: bool) {
        debug_assert!(!value || self.direction.contains(Direction::IN));
        self.wait_for = if value {
            self.wait_for | Direction::IN
        } else {
            self.wait_for.without(Direction::IN)
        };
    }

    /// Set or clear `OUT` in the watched direction set.
    pub fn set_wait_out(&mut self, value: bool) {
        debug_assert!(!value || self.direction.contains(Direction::OUT));
        self.wait_for = if value {
            self.wait_for | Direction::OUT
        } else {
            self.wait_for.without(Direction::OUT)
        };
    }

    /// True if this channel addresses peers by routing ID.
    pub fn routed(&self) -> bool {
        self.routed
    }

    /// Socket identity announced to peers.
    pub fn routing_id(&self) -> &RoutingId {
        &self.routing_id
    }

    /// Endpoints currently bound or connected.
    pub fn endpoints(&self) -> &[ZmqAddress] {
        &self.endpoints
    }

    /// Returns true if the channel is active (bound or connected).
    pub fn is_active(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// The underlying socket, if warm-up already created it.
    pub fn socket(&self) -> Option<&zmq::Socket> {
        self.socket.as_ref()
    }

    fn require_socket(&self) -> Result<&zmq::Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::channel(format!("channel '{}' has no socket", self.name)))
    }

    /// Create and configure the ZMQ socket for this channel.
    ///
    /// Idempotent; does nothing when the socket already exists.
    pub fn warm_up(&mut self, ctx: &zmq::Context) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = ctx.socket(self.kind.to_zmq())?;
        socket.set_identity(self.routing_id.as_bytes())?;
        socket.set_immediate(true)?;
        socket.set_sndtimeo(self.snd_timeout)?;
        socket.set_rcvtimeo(self.rcv_timeout)?;
        socket.set_linger(self.linger)?;
        if let Some(hwm) = self.sock_opts.rcvhwm {
            socket.set_rcvhwm(hwm)?;
        }
        if let Some(hwm) = self.sock_opts.sndhwm {
            socket.set_sndhwm(hwm)?;
        }
        match self.kind {
            SocketKind::Router => socket.set_router_mandatory(true)?,
            SocketKind::XPub => socket.set_xpub_verbose(true)?,
            _ => {}
        }
        self.socket = Some(socket);
        tracing::debug!(channel = %self.name, kind = %self.kind, "socket created");
        Ok(())
    }

    /// Bind the socket to an address.
    ///
    /// Returns the effective endpoint address, which may differ from
    /// the requested one when a wildcard specification is used.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the channel is in connect mode,
    /// when a second endpoint is opened on a PAIR socket, or when the
    /// endpoint is already bound.
    pub fn bind(&mut self, endpoint: &ZmqAddress) -> Result<ZmqAddress> {
        let socket = self.require_socket()?;
        if self.mode == SocketMode::Connect {
            return Err(Error::channel("cannot bind a connected channel"));
        }
        if self.kind == SocketKind::Pair && !self.endpoints.is_empty() {
            return Err(Error::channel("cannot open multiple endpoints for PAIR socket"));
        }
        if self.endpoints.contains(endpoint) {
            return Err(Error::channel(format!("endpoint '{endpoint}' already opened")));
        }
        socket.bind(endpoint.as_str())?;
        let resolved = match socket.get_last_endpoint()? {
            Ok(addr) => ZmqAddress::parse(&addr)
                .map_err(|err| Error::channel(err.to_string()))?,
            Err(_) => endpoint.clone(),
        };
        self.mode = SocketMode::Bind;
        self.endpoints.push(resolved.clone());
        tracing::debug!(channel = %self.name, endpoint = %resolved, "bound");
        Ok(resolved)
    }

    /// Unbind from an address, or from all bound endpoints when `None`.
    ///
    /// The address must be the one returned by [`bind`](Self::bind).
    pub fn unbind(&mut self, endpoint: Option<&ZmqAddress>) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::channel(format!("channel '{}' has no socket", self.name)))?;
        if self.mode != SocketMode::Bind {
            return Err(Error::channel("channel is not bound"));
        }
        if let Some(addr) = endpoint {
            if !self.endpoints.contains(addr) {
                return Err(Error::channel(format!("endpoint '{addr}' not bound")));
            }
        }
        let addrs: Vec<ZmqAddress> = match endpoint {
            Some(addr) => vec![addr.clone()],
            None => self.endpoints.clone(),
        };
        for addr in addrs {
            socket.unbind(addr.as_str())?;
            self.endpoints.retain(|e| e != &addr);
        }
        if self.endpoints.is_empty() {
            self.mode = SocketMode::Unknown;
        }
        Ok(())
    }

    /// Connect the socket to a remote endpoint. Endpoint bookkeeping
    /// only; session association happens in
    /// [`Channel::connect`].
    pub fn connect_endpoint(&mut self, endpoint: &ZmqAddress) -> Result<()> {
        let socket = self.require_socket()?;
        if self.mode == SocketMode::Bind {
            return Err(Error::channel("cannot connect a bound channel"));
        }
        if self.kind == SocketKind::Pair && !self.endpoints.is_empty() {
            return Err(Error::channel("cannot connect multiple endpoints for PAIR socket"));
        }
        if self.endpoints.contains(endpoint) {
            return Err(Error::channel(format!("endpoint '{endpoint}' already connected")));
        }
        socket.connect(endpoint.as_str())?;
        self.mode = SocketMode::Connect;
        self.endpoints.push(endpoint.clone());
        tracing::debug!(channel = %self.name, endpoint = %endpoint, "connected");
        Ok(())
    }

    /// Disconnect from an endpoint, or from all connected endpoints
    /// when `None`. Does not discard sessions bound to the endpoint.
    pub fn disconnect_endpoint(&mut self, endpoint: Option<&ZmqAddress>) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::channel(format!("channel '{}' has no socket", self.name)))?;
        if self.mode != SocketMode::Connect {
            return Err(Error::channel("channel is not connected"));
        }
        if let Some(addr) = endpoint {
            if !self.endpoints.contains(addr) {
                return Err(Error::channel(format!("endpoint '{addr}' not connected")));
            }
        }
        let addrs: Vec<ZmqAddress> = match endpoint {
            Some(addr) => vec![addr.clone()],
            None => self.endpoints.clone(),
        };
        for addr in addrs {
            socket.disconnect(addr.as_str())?;
            self.endpoints.retain(|e| e != &addr);
        }
        if self.endpoints.is_empty() {
            self.mode = SocketMode::Unknown;
        }
        Ok(())
    }

    /// Returns true if the socket can accept at least one outgoing
    /// message without blocking.
    ///
    /// May report true for a ROUTER socket attached to several peers
    /// even when a particular peer is congested.
    pub fn can_send(&self, timeout_ms: i64) -> bool {
        match self.socket.as_ref() {
            Some(socket) => matches!(socket.poll(zmq::POLLOUT, timeout_ms), Ok(n) if n > 0),
            None => false,
        }
    }

    /// Returns true if at least one message can be received without
    /// blocking.
    pub fn message_available(&self, timeout_ms: i64) -> bool {
        match self.socket.as_ref() {
            Some(socket) => matches!(socket.poll(zmq::POLLIN, timeout_ms), Ok(n) if n > 0),
            None => false,
        }
    }

    /// Wait for the events in [`wait_for`](Self::wait_for) on this
    /// channel only.
    pub fn wait(&self, timeout_ms: i64) -> Result<Direction> {
        let socket = self.require_socket()?;
        let mut items = [socket.as_poll_item(self.wait_for.to_poll_events())];
        match zmq::poll(&mut items, timeout_ms) {
            Ok(_) => Ok(Direction::from_poll_events(items[0].get_revents())),
            Err(zmq::Error::EINTR) => Ok(Direction::NONE),
            Err(err) => Err(err.into()),
        }
    }

    /// Send a multipart message, prefixing the routing ID on routed
    /// channels.
    ///
    /// # Errors
    ///
    /// Propagates ZMQ errors, including `EAGAIN` on send timeout.
    pub fn send_frames(&mut self, frames: &Zmsg, routing_id: &RoutingId) -> Result<()> {
        let socket = self.require_socket()?;
        debug_assert!(
            self.direction.contains(Direction::OUT),
            "send on receive-only channel"
        );
        let parts = frames.iter().map(|frame| frame.as_ref());
        if self.routed {
            socket.send_multipart(std::iter::once(routing_id.as_bytes()).chain(parts), 0)?;
        } else {
            socket.send_multipart(parts, 0)?;
        }
        Ok(())
    }

    /// Receive one multipart message.
    ///
    /// # Errors
    ///
    /// Propagates ZMQ errors, including `EAGAIN` on receive timeout.
    pub fn recv_frames(&mut self) -> Result<Zmsg> {
        let socket = self.require_socket()?;
        debug_assert!(
            self.direction.contains(Direction::IN),
            "receive on send-only channel"
        );
        let parts = socket.recv_multipart(0)?;
        Ok(parts.into_iter().map(Bytes::from).collect())
    }

    fn close_socket(&mut self) {
        self.socket = None;
    }

    fn drop_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.set_linger(0);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> Self {
        Self::new(name, SocketKind::Dealer, ChannelConfig::default()).unwrap()
    }
}

/// A ZeroMQ communication channel bound to a protocol.
pub struct Channel<P: Protocol> {
    core: ChannelCore,
    protocol: P,
    sessions: SessionStore<P::Session>,
}

impl<P: Protocol> Channel<P> {
    /// Create a channel; the socket is created later at warm-up.
    pub fn new(kind: SocketKind, name: &str, protocol: P, config: ChannelConfig) -> Result<Self> {
        Ok(Self {
            core: ChannelCore::new(name, kind, config)?,
            protocol,
            sessions: SessionStore::new(),
        })
    }

    /// Socket-facing channel state.
    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    /// Socket-facing channel state, mutably.
    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    /// The protocol bound to this channel.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// The protocol bound to this channel, mutably.
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Active sessions of this channel.
    pub fn sessions(&self) -> &SessionStore<P::Session> {
        &self.sessions
    }

    /// Active sessions of this channel, mutably.
    pub fn sessions_mut(&mut self) -> &mut SessionStore<P::Session> {
        &mut self.sessions
    }

    /// Split borrow of core, protocol and sessions.
    pub fn parts(&mut self) -> (&mut ChannelCore, &mut P, &mut SessionStore<P::Session>) {
        (&mut self.core, &mut self.protocol, &mut self.sessions)
    }

    /// Bind the channel socket to an address.
    ///
    /// See [`ChannelCore::bind`].
    pub fn bind(&mut self, endpoint: &ZmqAddress) -> Result<ZmqAddress> {
        self.core.bind(endpoint)
    }

    /// Unbind from an address (undoes a call to [`bind`](Self::bind)).
    pub fn unbind(&mut self, endpoint: Option<&ZmqAddress>) -> Result<()> {
        self.core.unbind(endpoint)
    }

    /// Connect to a remote channel.
    ///
    /// Consults the protocol about session association; when a session
    /// is created its routing ID is returned and the session records
    /// the connected endpoint. Routed channels require a routing ID.
    pub fn connect(
        &mut self,
        endpoint: &ZmqAddress,
        routing_id: Option<RoutingId>,
    ) -> Result<Option<RoutingId>> {
        if self.core.routed() && routing_id.is_none() {
            return Err(Error::channel("routed channel requires a routing ID to connect"));
        }
        let rid = routing_id.unwrap_or_else(RoutingId::internal);
        let mut created = None;
        if self.protocol.connect_with_session(&self.core) {
            let session = self.sessions.create(rid.clone())?;
            session.base_mut().endpoint = Some(endpoint.clone());
            self.protocol.initialize_session(session);
            created = Some(rid);
        }
        if let Err(err) = self.core.connect_endpoint(endpoint) {
            if let Some(rid) = created.take() {
                self.sessions.remove(&rid);
            }
            return Err(err);
        }
        Ok(created)
    }

    /// Disconnect from an endpoint, or all endpoints when `None`.
    ///
    /// Sessions bound to the endpoint are kept; use
    /// [`discard_session`](Self::discard_session) to drop them.
    pub fn disconnect(&mut self, endpoint: Option<&ZmqAddress>) -> Result<()> {
        self.core.disconnect_endpoint(endpoint)
    }

    /// Create a session for a peer.
    pub fn create_session(&mut self, routing_id: RoutingId) -> Result<&mut P::Session> {
        let session = self.sessions.create(routing_id)?;
        self.protocol.initialize_session(session);
        Ok(session)
    }

    /// Discard a session, disconnecting any endpoint bound to it.
    pub fn discard_session(&mut self, routing_id: &RoutingId) -> Option<P::Session> {
        discard_session(&mut self.core, &mut self.sessions, routing_id)
    }

    /// Send a protocol message to the peer identified by `routing_id`.
    ///
    /// `EAGAIN` is routed to the protocol's `on_send_later` hook and
    /// hard errors to `on_send_failed`; when the hook claims the
    /// failure the send reports success.
    pub fn send(&mut self, msg: &P::Message, routing_id: &RoutingId) -> Result<()> {
        let frames = msg.to_frames();
        match self.core.send_frames(&frames, routing_id) {
            Ok(()) => Ok(()),
            Err(err) if err.is_again() => {
                if self.protocol.on_send_later(&mut self.core, routing_id, msg) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(Error::Zmq(zmq_err)) => {
                if self.protocol.on_send_failed(&mut self.core, routing_id, msg, &zmq_err) {
                    Ok(())
                } else {
                    Err(Error::Zmq(zmq_err))
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Receive and process one protocol message.
    ///
    /// With a timeout, polls for input first and yields
    /// [`Received::Timeout`] when nothing arrives. Strips the routing
    /// ID on routed channels, looks up (or accepts) the session, then
    /// validates, parses and dispatches the message. Any validation
    /// failure is routed to the protocol's invalid-message hook and
    /// yields [`Received::Invalid`].
    pub fn receive(&mut self, timeout_ms: Option<i64>) -> Result<Received<P::Message>> {
        if let Some(timeout) = timeout_ms {
            if !self.core.message_available(timeout) {
                return Ok(Received::Timeout);
            }
        }
        let mut frames = match self.core.recv_frames() {
            Ok(frames) => frames,
            Err(err) if err.is_again() => {
                return if self.protocol.on_receive_later(&mut self.core) {
                    Ok(Received::Invalid)
                } else {
                    Err(err)
                };
            }
            Err(Error::Zmq(zmq_err)) => {
                return if self.protocol.on_receive_failed(&mut self.core, &zmq_err) {
                    Ok(Received::Invalid)
                } else {
                    Err(Error::Zmq(zmq_err))
                };
            }
            Err(err) => return Err(err),
        };
        let routing_id = if self.core.routed() {
            if frames.is_empty() {
                return Ok(Received::Invalid);
            }
            RoutingId::from(frames.remove(0))
        } else {
            RoutingId::internal()
        };
        if let Err(err) = self.protocol.validate(&frames) {
            self.protocol.handle_invalid_message(
                &mut self.core,
                &mut self.sessions,
                Some(&routing_id),
                &err,
            );
            return Ok(Received::Invalid);
        }
        let msg = match self.protocol.parse(&frames) {
            Ok(msg) => msg,
            Err(err) => {
                self.protocol.handle_invalid_message(
                    &mut self.core,
                    &mut self.sessions,
                    Some(&routing_id),
                    &err,
                );
                return Ok(Received::Invalid);
            }
        };
        if !self.sessions.contains(&routing_id) {
            // First message received from this peer
            if !self.protocol.accept_new_session(
                &mut self.core,
                &mut self.sessions,
                &routing_id,
                &msg,
            ) {
                return Ok(Received::Invalid);
            }
            let session = self.sessions.create(routing_id.clone())?;
            self.protocol.initialize_session(session);
        }
        Ok(self
            .protocol
            .handle_message(&mut self.core, &mut self.sessions, &routing_id, &msg))
    }

    /// Set or clear `OUT` in the watched direction set, updating the
    /// session's waiting-for-send flag.
    ///
    /// # Errors
    ///
    /// Returns a channel error for routed channels with active
    /// sessions when no session routing ID is given.
    pub fn set_wait_out(&mut self, value: bool, routing_id: Option<&RoutingId>) -> Result<()> {
        let rid = match routing_id {
            Some(rid) => Some(rid.clone()),
            None if !self.sessions.is_empty() => {
                if self.core.routed() {
                    return Err(Error::channel("session required for routed channel"));
                }
                self.sessions.single().map(|s| s.routing_id().clone())
            }
            None => None,
        };
        self.core.set_wait_out(value);
        if let Some(rid) = rid {
            if let Some(session) = self.sessions.get_mut(&rid) {
                session.set_send_pending(value);
            }
        }
        Ok(())
    }

    /// Subscribe to a topic (SUB and XSUB channels).
    pub fn subscribe(&mut self, topic: &[u8]) -> Result<()> {
        let socket = self.core.require_socket()?;
        match self.core.kind() {
            SocketKind::Sub => socket.set_subscribe(topic)?,
            SocketKind::XSub => {
                let mut frame = Vec::with_capacity(topic.len() + 1);
                frame.push(1);
                frame.extend_from_slice(topic);
                socket.send(frame, 0)?;
            }
            _ => return Err(Error::channel("subscribe requires a SUB or XSUB channel")),
        }
        Ok(())
    }

    /// Unsubscribe from a topic (SUB and XSUB channels).
    pub fn unsubscribe(&mut self, topic: &[u8]) -> Result<()> {
        let socket = self.core.require_socket()?;
        match self.core.kind() {
            SocketKind::Sub => socket.set_unsubscribe(topic)?,
            SocketKind::XSub => {
                let mut frame = Vec::with_capacity(topic.len() + 1);
                frame.push(0);
                frame.extend_from_slice(topic);
                socket.send(frame, 0)?;
            }
            _ => return Err(Error::channel("unsubscribe requires a SUB or XSUB channel")),
        }
        Ok(())
    }
}

/// Object-safe channel view used by the manager and the event loop.
pub trait ManagedChannel {
    /// Channel name.
    fn name(&self) -> &str;
    /// ZMQ socket kind.
    fn kind(&self) -> SocketKind;
    /// Directions currently watched.
    fn wait_for(&self) -> Direction;
    /// The underlying socket, if created.
    fn socket(&self) -> Option<&zmq::Socket>;
    /// Create and configure the socket.
    fn warm_up(&mut self, ctx: &zmq::Context) -> Result<()>;
    /// Bind the socket to an address, returning the resolved endpoint.
    fn bind(&mut self, endpoint: &ZmqAddress) -> Result<ZmqAddress>;
    /// Receive and dispatch one pending message.
    fn handle_input(&mut self) -> Result<()>;
    /// Let the protocol pump pending output.
    fn handle_output(&mut self) -> Result<()>;
    /// Shut the channel down: release endpoints, clear sessions, close
    /// or drop the socket. Deterministic and idempotent.
    fn shutdown(&mut self, forced: bool);
}

impl<P: Protocol> ManagedChannel for Channel<P> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> SocketKind {
        self.core.kind()
    }

    fn wait_for(&self) -> Direction {
        self.core.wait_for()
    }

    fn socket(&self) -> Option<&zmq::Socket> {
        self.core.socket()
    }

    fn warm_up(&mut self, ctx: &zmq::Context) -> Result<()> {
        self.core.warm_up(ctx)
    }

    fn bind(&mut self, endpoint: &ZmqAddress) -> Result<ZmqAddress> {
        self.core.bind(endpoint)
    }

    fn handle_input(&mut self) -> Result<()> {
        self.receive(None).map(|_| ())
    }

    fn handle_output(&mut self) -> Result<()> {
        let (core, protocol, sessions) = self.parts();
        protocol.handle_output_ready(core, sessions)
    }

    fn shutdown(&mut self, forced: bool) {
        let (core, protocol, sessions) = (&mut self.core, &mut self.protocol, &mut self.sessions);
        protocol.on_shutdown(core, sessions, forced);
        let result = match core.mode() {
            SocketMode::Bind => core.unbind(None),
            SocketMode::Connect => core.disconnect_endpoint(None),
            SocketMode::Unknown => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!(channel = core.name(), error = %err, "endpoint release on shutdown failed");
        }
        sessions.clear();
        if forced {
            core.drop_socket();
        } else {
            core.close_socket();
        }
    }
}
