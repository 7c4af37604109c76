//! ICCP: the internal component control protocol.
//!
//! ICCP runs over an inproc PAIR channel between a component and its
//! controller. It carries the startup handshake (`READY`),
//! reconfiguration (`REQUEST`), graceful stop (`STOP`) and termination
//! reporting (`FINISHED`/`ERROR`).
//!
//! Wire layout: frame 0 is a big-endian `u16` message type; further
//! frames depend on the type (peer dataframe + endpoints map for
//! READY, a request tag + configuration blob for REQUEST, a UTF-8
//! string for ERROR, the outcome string plus detail lines for
//! FINISHED).

use bytes::Bytes;

use ferrobus_core::channel::ChannelCore;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::message::{be_u16, text_frame, Zmsg};
use ferrobus_core::protocol::{DispatchKey, HandlerMap, Protocol, ProtocolMessage};
use ferrobus_core::session::{Session, SessionBase, SessionStore};
use ferrobus_core::types::{EndpointMap, Outcome, PeerDescriptor, RoutingId};

use crate::payload::{self, EndpointsFrame, PeerInfo};

/// Request tag for the CONFIGURE request.
pub const REQUEST_CONFIGURE: &[u8] = b"CONF";

/// ICCP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Component is initialized and announces peer and endpoints.
    Ready = 1,
    /// Controller request to the component.
    Request = 2,
    /// Positive response to a request.
    Ok = 3,
    /// Error report.
    Error = 4,
    /// Controller asks the component to stop.
    Stop = 5,
    /// Component finished and reports its outcome.
    Finished = 6,
}

impl MsgType {
    /// Decode from the wire value.
    pub fn from_wire(value: u16) -> Option<MsgType> {
        Some(match value {
            1 => MsgType::Ready,
            2 => MsgType::Request,
            3 => MsgType::Ok,
            4 => MsgType::Error,
            5 => MsgType::Stop,
            6 => MsgType::Finished,
            _ => return None,
        })
    }
}

/// Controller request carried in a REQUEST message.
#[derive(Debug, Clone)]
pub enum IccpRequest {
    /// Apply a new configuration. The blob is opaque to the control
    /// protocol; the component's configuration hook interprets it.
    Configure(Bytes),
}

/// Internal component control message.
#[derive(Debug, Clone)]
pub enum IccpMessage {
    /// Startup announcement with peer identity and bound endpoints.
    Ready {
        /// Component peer descriptor.
        peer: PeerDescriptor,
        /// Endpoints actually bound, per channel.
        endpoints: EndpointMap,
    },
    /// Controller request.
    Request(IccpRequest),
    /// Positive response.
    Ok,
    /// Error report (optionally with a traceback rendering).
    Error(String),
    /// Stop request.
    Stop,
    /// Termination report.
    Finished {
        /// Terminal status.
        outcome: Outcome,
        /// Detail lines.
        details: Vec<String>,
    },
}

impl IccpMessage {
    /// The message type tag.
    pub fn msg_type(&self) -> MsgType {
        match self {
            IccpMessage::Ready { .. } => MsgType::Ready,
            IccpMessage::Request(_) => MsgType::Request,
            IccpMessage::Ok => MsgType::Ok,
            IccpMessage::Error(_) => MsgType::Error,
            IccpMessage::Stop => MsgType::Stop,
            IccpMessage::Finished { .. } => MsgType::Finished,
        }
    }
}

impl ProtocolMessage for IccpMessage {
    type Key = DispatchKey<MsgType>;

    fn from_frames(frames: &Zmsg) -> Result<Self> {
        let type_frame = frames
            .first()
            .ok_or_else(|| Error::invalid("empty message"))?;
        let msg_type = MsgType::from_wire(be_u16(type_frame)?)
            .ok_or_else(|| Error::invalid("invalid message type"))?;
        let msg = match msg_type {
            MsgType::Ready => {
                let peer_frame = frames
                    .get(1)
                    .ok_or_else(|| Error::invalid("invalid data: peer descriptor"))?;
                let peer: PeerInfo = payload::decode(peer_frame)
                    .map_err(|_| Error::invalid("invalid data: peer descriptor"))?;
                let endpoints_frame = frames
                    .get(2)
                    .ok_or_else(|| Error::invalid("invalid data: endpoints"))?;
                let endpoints: EndpointsFrame = payload::decode(endpoints_frame)
                    .map_err(|_| Error::invalid("invalid data: endpoints"))?;
                IccpMessage::Ready {
                    peer: peer.into(),
                    endpoints: endpoints.into_map()?,
                }
            }
            MsgType::Request => {
                let tag = frames
                    .get(1)
                    .ok_or_else(|| Error::invalid("missing request code"))?;
                if tag.as_ref() != REQUEST_CONFIGURE {
                    return Err(Error::invalid("invalid request code"));
                }
                let config = frames
                    .get(2)
                    .ok_or_else(|| Error::invalid("invalid data: config"))?;
                IccpMessage::Request(IccpRequest::Configure(config.clone()))
            }
            MsgType::Ok => IccpMessage::Ok,
            MsgType::Error => {
                let error_frame = frames
                    .get(1)
                    .ok_or_else(|| Error::invalid("invalid data: error message"))?;
                IccpMessage::Error(text_frame(error_frame)?.to_string())
            }
            MsgType::Stop => IccpMessage::Stop,
            MsgType::Finished => {
                let outcome_frame = frames
                    .get(1)
                    .ok_or_else(|| Error::invalid("invalid data: outcome"))?;
                let outcome = Outcome::from_wire(text_frame(outcome_frame)?)
                    .ok_or_else(|| Error::invalid("invalid data: outcome"))?;
                let details = frames[2..]
                    .iter()
                    .map(|frame| String::from_utf8_lossy(frame).into_owned())
                    .collect();
                IccpMessage::Finished { outcome, details }
            }
        };
        Ok(msg)
    }

    fn to_frames(&self) -> Zmsg {
        let mut frames: Zmsg =
            vec![Bytes::copy_from_slice(&(self.msg_type() as u16).to_be_bytes())];
        match self {
            IccpMessage::Ready { peer, endpoints } => {
                frames.push(payload::encode(&PeerInfo::from(peer)));
                frames.push(payload::encode(&EndpointsFrame::from_map(endpoints)));
            }
            IccpMessage::Request(IccpRequest::Configure(config)) => {
                frames.push(Bytes::from_static(REQUEST_CONFIGURE));
                frames.push(config.clone());
            }
            IccpMessage::Error(error) => {
                frames.push(Bytes::from(error.clone().into_bytes()));
            }
            IccpMessage::Finished { outcome, details } => {
                frames.push(Bytes::from_static(outcome.as_str().as_bytes()));
                frames.extend(
                    details.iter().map(|line| Bytes::from(line.clone().into_bytes())),
                );
            }
            IccpMessage::Ok | IccpMessage::Stop => {}
        }
        frames
    }

    fn keys(&self) -> Vec<Self::Key> {
        vec![DispatchKey::Exact(self.msg_type()), DispatchKey::Any]
    }

    fn clear(&mut self) {
        *self = IccpMessage::Ok;
    }
}

/// ICCP session: the base session plus the READY handshake flag used
/// by the controller side.
#[derive(Debug)]
pub struct IccpSession {
    base: SessionBase,
    /// Controller side: READY was received from the component.
    pub ready: bool,
}

impl From<SessionBase> for IccpSession {
    fn from(base: SessionBase) -> Self {
        Self { base, ready: false }
    }
}

impl Session for IccpSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SessionBase {
        &mut self.base
    }
}

/// Component-side ICCP events.
pub trait IccpComponentEvents: 'static {
    /// The component should stop its operation; with an error when the
    /// stop is caused by a failure rather than a controller request.
    fn on_stop_component(&mut self, err: Option<&Error>);

    /// The controller requested reconfiguration. Failures are reported
    /// back as an ERROR message.
    fn on_config_request(&mut self, config: &Bytes) -> Result<()> {
        let _ = config;
        Err(Error::service("component does not support run-time configuration"))
    }
}

/// Render an error (and its source chain) for an ERROR message.
fn render_error(err: &Error, with_traceback: bool) -> String {
    if !with_traceback {
        return err.to_string();
    }
    let mut rendered = format!("{err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        rendered.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    rendered
}

/// ICCP component (client) side.
pub struct IccpComponent<E: IccpComponentEvents> {
    handlers: HandlerMap<Self>,
    with_traceback: bool,
    /// Attached component logic.
    pub events: E,
}

impl<E: IccpComponentEvents> IccpComponent<E> {
    /// Component protocol driving `events`. With `with_traceback`,
    /// ERROR and FINISHED payloads include the error source chain.
    pub fn new(events: E, with_traceback: bool) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Request), Self::handle_request as _);
        handlers.set(DispatchKey::Exact(MsgType::Stop), Self::handle_stop as _);
        handlers.set(DispatchKey::Any, Self::handle_wrong_message as _);
        Self { handlers, with_traceback, events }
    }

    /// READY control message.
    pub fn ready_msg(&self, peer: &PeerDescriptor, endpoints: &EndpointMap) -> IccpMessage {
        IccpMessage::Ready { peer: peer.clone(), endpoints: endpoints.clone() }
    }

    /// OK control message.
    pub fn ok_msg(&self) -> IccpMessage {
        IccpMessage::Ok
    }

    /// ERROR control message for a failure.
    pub fn error_msg(&self, err: &Error) -> IccpMessage {
        IccpMessage::Error(render_error(err, self.with_traceback))
    }

    /// FINISHED control message.
    pub fn finished_msg(&self, outcome: Outcome, details: Vec<String>) -> IccpMessage {
        IccpMessage::Finished { outcome, details }
    }

    fn handle_request(
        proto: &mut Self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        rid: &RoutingId,
        msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        let IccpMessage::Request(IccpRequest::Configure(config)) = msg else {
            return Err(Error::service("wrong message received from controller"));
        };
        let reply = match proto.events.on_config_request(config) {
            Ok(()) => proto.ok_msg(),
            Err(err) => proto.error_msg(&err),
        };
        channel
            .send_frames(&reply.to_frames(), rid)
            .map_err(|_| Error::service("send to controller failed"))?;
        Ok(None)
    }

    fn handle_stop(
        proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        proto.events.on_stop_component(None);
        Ok(None)
    }

    fn handle_wrong_message(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        Err(Error::service("wrong message received from controller"))
    }
}

impl<E: IccpComponentEvents> Protocol for IccpComponent<E> {
    type Session = IccpSession;
    type Message = IccpMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn accept_new_session(
        &mut self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
    ) -> bool {
        // Transmission must be initiated by the component.
        false
    }

    fn connect_with_session(&self, _channel: &ChannelCore) -> bool {
        true
    }

    fn handle_invalid_message(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: Option<&RoutingId>,
        err: &Error,
    ) {
        tracing::warn!(channel = channel.name(), error = %err, "invalid control message");
        self.events.on_stop_component(Some(err));
    }

    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
        err: &Error,
    ) {
        tracing::warn!(channel = channel.name(), error = %err, "control message failed");
        self.events.on_stop_component(Some(err));
    }
}

/// Controller-side ICCP events.
pub trait IccpControllerEvents: 'static {
    /// The controller should stop due to an error condition.
    fn on_stop_controller(&mut self, err: &Error) {
        let _ = err;
    }
}

/// Controller events that only log the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingControllerEvents;

impl IccpControllerEvents for LoggingControllerEvents {
    fn on_stop_controller(&mut self, err: &Error) {
        tracing::error!(error = %err, "internal controller error");
    }
}

/// ICCP controller (server) side.
pub struct IccpController<E: IccpControllerEvents = LoggingControllerEvents> {
    handlers: HandlerMap<Self>,
    /// Attached controller logic.
    pub events: E,
}

impl Default for IccpController<LoggingControllerEvents> {
    fn default() -> Self {
        Self::new(LoggingControllerEvents)
    }
}

impl<E: IccpControllerEvents> IccpController<E> {
    /// Controller protocol driving `events`.
    pub fn new(events: E) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Ready), Self::handle_ready as _);
        handlers.set(DispatchKey::Exact(MsgType::Ok), Self::handle_report as _);
        handlers.set(DispatchKey::Exact(MsgType::Error), Self::handle_report as _);
        handlers.set(DispatchKey::Exact(MsgType::Finished), Self::handle_report as _);
        handlers.set(DispatchKey::Any, Self::handle_wrong_message as _);
        Self { handlers, events }
    }

    /// STOP control message.
    pub fn stop_msg(&self) -> IccpMessage {
        IccpMessage::Stop
    }

    /// CONFIGURE request message for an opaque configuration blob.
    pub fn request_config_msg(&self, config: Bytes) -> IccpMessage {
        IccpMessage::Request(IccpRequest::Configure(config))
    }

    fn handle_ready(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        sessions: &mut SessionStore<IccpSession>,
        rid: &RoutingId,
        msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for READY message"))?;
        if session.ready {
            return Err(Error::service("unexpected READY message from component"));
        }
        session.ready = true;
        Ok(Some(msg.clone()))
    }

    fn handle_report(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        sessions: &mut SessionStore<IccpSession>,
        rid: &RoutingId,
        msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for component report"))?;
        if matches!(msg.msg_type(), MsgType::Ok | MsgType::Finished) && !session.ready {
            return Err(Error::service(format!(
                "unexpected {:?} message from component",
                msg.msg_type()
            )));
        }
        Ok(Some(msg.clone()))
    }

    fn handle_wrong_message(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
    ) -> Result<Option<IccpMessage>> {
        Err(Error::service("wrong message received from component"))
    }
}

impl<E: IccpControllerEvents> Protocol for IccpController<E> {
    type Session = IccpSession;
    type Message = IccpMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn handle_invalid_message(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: Option<&RoutingId>,
        err: &Error,
    ) {
        tracing::warn!(channel = channel.name(), error = %err, "invalid control message");
        self.events.on_stop_controller(err);
    }

    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<IccpSession>,
        _rid: &RoutingId,
        _msg: &IccpMessage,
        err: &Error,
    ) {
        tracing::warn!(channel = channel.name(), error = %err, "control message failed");
        self.events.on_stop_controller(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_ready_roundtrip() {
        let peer = PeerDescriptor::new(Uuid::new_v4());
        let mut endpoints = EndpointMap::new();
        endpoints.insert("service".to_string(), vec!["tcp://127.0.0.1:5555".parse().unwrap()]);
        let msg = IccpMessage::Ready { peer: peer.clone(), endpoints: endpoints.clone() };
        let decoded = IccpMessage::from_frames(&msg.to_frames()).unwrap();
        let IccpMessage::Ready { peer: got_peer, endpoints: got_endpoints } = decoded else {
            panic!("expected READY");
        };
        assert_eq!(got_peer, peer);
        assert_eq!(got_endpoints, endpoints);
    }

    #[test]
    fn test_finished_roundtrip() {
        let msg = IccpMessage::Finished {
            outcome: Outcome::Ok,
            details: vec!["all done".to_string(), "without drama".to_string()],
        };
        let frames = msg.to_frames();
        assert_eq!(frames[1].as_ref(), b"OK");
        let decoded = IccpMessage::from_frames(&frames).unwrap();
        let IccpMessage::Finished { outcome, details } = decoded else {
            panic!("expected FINISHED");
        };
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(details.len(), 2);
    }

    #[test]
    fn test_request_roundtrip() {
        let blob = Bytes::from_static(b"opaque configuration");
        let msg = IccpMessage::Request(IccpRequest::Configure(blob.clone()));
        let frames = msg.to_frames();
        assert_eq!(frames[1].as_ref(), REQUEST_CONFIGURE);
        let decoded = IccpMessage::from_frames(&frames).unwrap();
        let IccpMessage::Request(IccpRequest::Configure(got)) = decoded else {
            panic!("expected REQUEST");
        };
        assert_eq!(got, blob);
    }

    #[test]
    fn test_bare_messages_roundtrip() {
        for msg in [IccpMessage::Ok, IccpMessage::Stop] {
            let frames = msg.to_frames();
            assert_eq!(frames.len(), 1);
            let decoded = IccpMessage::from_frames(&frames).unwrap();
            assert_eq!(decoded.msg_type(), msg.msg_type());
        }
    }

    #[test]
    fn test_invalid_type_rejected() {
        assert!(IccpMessage::from_frames(&vec![Bytes::from_static(&[0, 99])]).is_err());
        assert!(IccpMessage::from_frames(&vec![Bytes::from_static(b"x")]).is_err());
        assert!(IccpMessage::from_frames(&vec![]).is_err());
    }

    #[test]
    fn test_invalid_request_tag() {
        let frames: Zmsg = vec![
            Bytes::copy_from_slice(&2u16.to_be_bytes()),
            Bytes::from_static(b"NOPE"),
            Bytes::from_static(b"blob"),
        ];
        assert!(IccpMessage::from_frames(&frames).is_err());
    }

    #[test]
    fn test_error_rendering_with_chain() {
        let err = Error::from(zmq::Error::EHOSTUNREACH);
        assert!(render_error(&err, false).starts_with("ZMQ error"));
        let full = render_error(&err, true);
        assert!(full.contains("caused by:"));
    }
}
