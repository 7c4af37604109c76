//! FBSP: the request/reply service protocol.
//!
//! FBSP connects clients to services over routed sockets with
//! sessions, a HELLO/WELCOME handshake, API request dispatch,
//! cancellation, state reporting and ACK flows.
//!
//! Wire layout: a 16-byte control frame
//! `"FBSP" | control_byte | flags | type_data(u16 BE) | token(8)`
//! where the low 3 bits of `control_byte` carry the protocol revision
//! and the high 5 bits the message type. For REQUEST/REPLY/STATE the
//! `type_data` is `(interface_id << 8) | api_code`; for ERROR the
//! upper 11 bits carry the error code and the lower 5 the message
//! type the error relates to. The token is a client-chosen
//! correlation id.

use bytes::Bytes;
use hashbrown::HashMap;
use uuid::Uuid;

use ferrobus_core::channel::ChannelCore;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::message::Zmsg;
use ferrobus_core::protocol::{
    discard_session, DispatchKey, HandlerMap, Protocol, ProtocolMessage,
};
use ferrobus_core::session::{Session, SessionBase, SessionStore};
use ferrobus_core::types::{
    AgentDescriptor, PeerDescriptor, RoutingId, ServiceDescriptor, State,
};

use crate::payload::{
    self, AgentInfo, CancelRequests, ErrorDescription, HelloDataframe, InterfaceSpec, PeerInfo,
    StateInformation, WelcomeDataframe,
};

/// FBSP protocol identification (FourCC).
pub const FOURCC: &[u8; 4] = b"FBSP";
/// FBSP protocol revision.
pub const REVISION: u8 = 1;
/// FBSP control frame length.
pub const HEADER_LEN: usize = 16;
/// Protocol version mask in the control byte.
pub const VERSION_MASK: u8 = 7;
/// Mask of the relates-to message type in ERROR `type_data`.
pub const ERROR_TYPE_MASK: u16 = 31;

/// FBSP message token: an opaque 8-byte correlation id.
pub type Token = [u8; 8];

/// FBSP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Initial message from client.
    Hello = 1,
    /// Initial message from service.
    Welcome = 2,
    /// No operation, used for keep-alive & ping purposes.
    Noop = 3,
    /// Client request.
    Request = 4,
    /// Service response to a client request.
    Reply = 5,
    /// Separate data sent by either side.
    Data = 6,
    /// Cancel request.
    Cancel = 7,
    /// Operating state information.
    State = 8,
    /// Sent by the peer that is going to close the connection.
    Close = 9,
    /// Error reported by the service.
    Error = 31,
}

impl MsgType {
    /// Decode from the control byte's type bits.
    pub fn from_wire(value: u8) -> Option<MsgType> {
        Some(match value {
            1 => MsgType::Hello,
            2 => MsgType::Welcome,
            3 => MsgType::Noop,
            4 => MsgType::Request,
            5 => MsgType::Reply,
            6 => MsgType::Data,
            7 => MsgType::Cancel,
            8 => MsgType::State,
            9 => MsgType::Close,
            31 => MsgType::Error,
            _ => return None,
        })
    }
}

/// FBSP message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(u8);

impl MsgFlags {
    /// No flags.
    pub const NONE: MsgFlags = MsgFlags(0);
    /// Sender requests an acknowledgement.
    pub const ACK_REQ: MsgFlags = MsgFlags(1);
    /// Message is an acknowledgement; it carries no body.
    pub const ACK_REPLY: MsgFlags = MsgFlags(2);
    /// More messages follow.
    pub const MORE: MsgFlags = MsgFlags(4);

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Decode flags; reserved bits are rejected.
    pub fn from_wire(value: u8) -> Option<MsgFlags> {
        if value & !7 != 0 {
            return None;
        }
        Some(MsgFlags(value))
    }

    /// Returns true if all flags in `other` are set.
    pub fn has(self, other: MsgFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Set the flags in `other`.
    pub fn set(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    pub fn clear(&mut self, other: MsgFlags) {
        self.0 &= !other.0;
    }
}

/// FBSP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// A formal error was detected in a message.
    InvalidMessage = 1,
    /// Peer violated the protocol rules.
    ProtocolViolation = 2,
    /// Request cannot be satisfied as stated.
    BadRequest = 3,
    /// Requested operation is not implemented.
    NotImplemented = 4,
    /// General error.
    Error = 5,
    /// Unexpected internal service failure.
    InternalError = 6,
    /// Request processing timed out.
    RequestTimeout = 7,
    /// Service refuses further requests for now.
    TooManyRequests = 8,
    /// A dependency of the request failed.
    FailedDependency = 9,
    /// Request is forbidden.
    Forbidden = 10,
    /// Peer is not authorized.
    Unauthorized = 11,
    /// Requested entity was not found.
    NotFound = 12,
    /// Requested entity is gone.
    Gone = 13,
    /// Request conflicts with service state.
    Conflict = 14,
    /// Request payload is too large.
    PayloadTooLarge = 15,
    /// Service ran out of storage.
    InsufficientStorage = 16,
    /// Request was cancelled.
    RequestCancelled = 17,
    /// Connection must be terminated: service unavailable.
    ServiceUnavailable = 2000,
    /// Connection must be terminated: unsupported protocol version.
    FbspVersionNotSupported = 2001,
}

impl ErrorCode {
    /// Decode from the wire value.
    pub fn from_wire(value: u16) -> Option<ErrorCode> {
        Some(match value {
            1 => ErrorCode::InvalidMessage,
            2 => ErrorCode::ProtocolViolation,
            3 => ErrorCode::BadRequest,
            4 => ErrorCode::NotImplemented,
            5 => ErrorCode::Error,
            6 => ErrorCode::InternalError,
            7 => ErrorCode::RequestTimeout,
            8 => ErrorCode::TooManyRequests,
            9 => ErrorCode::FailedDependency,
            10 => ErrorCode::Forbidden,
            11 => ErrorCode::Unauthorized,
            12 => ErrorCode::NotFound,
            13 => ErrorCode::Gone,
            14 => ErrorCode::Conflict,
            15 => ErrorCode::PayloadTooLarge,
            16 => ErrorCode::InsufficientStorage,
            17 => ErrorCode::RequestCancelled,
            2000 => ErrorCode::ServiceUnavailable,
            2001 => ErrorCode::FbspVersionNotSupported,
            _ => return None,
        })
    }

    /// The wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Compose an API request code from interface id and API code.
pub fn request_code(interface_id: u8, api_code: u8) -> u16 {
    (u16::from(interface_id) << 8) | u16::from(api_code)
}

/// Payload attached to an FBSP message, by message type.
#[derive(Debug, Clone, Default)]
pub enum FbspPayload {
    /// NOOP and CLOSE carry nothing; so does any ACK-REPLY.
    #[default]
    None,
    /// HELLO dataframe.
    Hello(HelloDataframe),
    /// WELCOME dataframe.
    Welcome(WelcomeDataframe),
    /// REQUEST/REPLY/DATA payload frames.
    Frames(Zmsg),
    /// CANCEL request dataframe.
    Cancel(CancelRequests),
    /// STATE information plus optional API frames.
    State {
        /// Reported state.
        info: StateInformation,
        /// Additional API-specific frames.
        frames: Zmsg,
    },
    /// ERROR descriptions.
    Errors(Vec<ErrorDescription>),
}

/// FBSP protocol message.
#[derive(Debug, Clone)]
pub struct FbspMessage {
    /// Type of message.
    pub msg_type: MsgType,
    /// Message flags.
    pub flags: MsgFlags,
    /// Type-specific control data.
    pub type_data: u16,
    /// Message token.
    pub token: Token,
    /// Payload of the message.
    pub payload: FbspPayload,
}

impl FbspMessage {
    /// Message of the given type with default payload.
    pub fn new(msg_type: MsgType, token: Token, type_data: u16) -> Self {
        let payload = match msg_type {
            MsgType::Hello => FbspPayload::Hello(HelloDataframe::default()),
            MsgType::Welcome => FbspPayload::Welcome(WelcomeDataframe::default()),
            MsgType::Request | MsgType::Reply | MsgType::Data => {
                FbspPayload::Frames(Zmsg::new())
            }
            MsgType::Cancel => FbspPayload::Cancel(CancelRequests::default()),
            MsgType::State => FbspPayload::State {
                info: StateInformation::default(),
                frames: Zmsg::new(),
            },
            MsgType::Error => FbspPayload::Errors(Vec::new()),
            _ => FbspPayload::None,
        };
        Self { msg_type, flags: MsgFlags::NONE, type_data, token, payload }
    }

    /// New ACK-REPLY answering `msg`.
    pub fn ack_reply_for(msg: &FbspMessage) -> Self {
        let mut reply = Self::new(msg.msg_type, msg.token, msg.type_data);
        reply.flags = msg.flags;
        reply.flags.clear(MsgFlags::ACK_REQ);
        reply.flags.set(MsgFlags::ACK_REPLY);
        reply.payload = FbspPayload::None;
        reply
    }

    /// New REPLY for a REQUEST.
    pub fn reply_for(request: &FbspMessage) -> Self {
        Self::new(MsgType::Reply, request.token, request.type_data)
    }

    /// New DATA message related to `msg` by token.
    pub fn data_for(msg: &FbspMessage) -> Self {
        Self::new(MsgType::Data, msg.token, 0)
    }

    /// New STATE message for a REQUEST.
    pub fn state_for(request: &FbspMessage, state: State) -> Self {
        let mut msg = Self::new(MsgType::State, request.token, request.type_data);
        msg.payload = FbspPayload::State {
            info: StateInformation { state: state as u16 },
            frames: Zmsg::new(),
        };
        msg
    }

    /// New ERROR message relating to `relates_to`.
    pub fn error_for(relates_to: &FbspMessage, error_code: ErrorCode) -> Self {
        let type_data = (error_code.as_u16() << 5) | u16::from(relates_to.msg_type as u8);
        Self::new(MsgType::Error, relates_to.token, type_data)
    }

    /// The control frame of this message.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(FOURCC);
        header[4] = ((self.msg_type as u8) << 3) | REVISION;
        header[5] = self.flags.bits();
        header[6..8].copy_from_slice(&self.type_data.to_be_bytes());
        header[8..16].copy_from_slice(&self.token);
        header
    }

    /// Returns true if the message has the ACK_REQ flag set.
    pub fn has_ack_req(&self) -> bool {
        self.flags.has(MsgFlags::ACK_REQ)
    }

    /// Returns true if the message has the ACK_REPLY flag set.
    pub fn has_ack_reply(&self) -> bool {
        self.flags.has(MsgFlags::ACK_REPLY)
    }

    /// Returns true if the message has the MORE flag set.
    pub fn has_more(&self) -> bool {
        self.flags.has(MsgFlags::MORE)
    }

    /// Interface ID part of an API request code.
    pub fn interface_id(&self) -> u8 {
        (self.type_data >> 8) as u8
    }

    /// API code part of an API request code.
    pub fn api_code(&self) -> u8 {
        (self.type_data & 0xff) as u8
    }

    /// Error code of an ERROR message.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_wire(self.type_data >> 5)
    }

    /// Message type an ERROR message relates to; `None` when the
    /// related type is unknown.
    pub fn relates_to(&self) -> Option<MsgType> {
        MsgType::from_wire((self.type_data & ERROR_TYPE_MASK) as u8)
    }

    /// Error descriptions of an ERROR message.
    pub fn errors(&self) -> &[ErrorDescription] {
        match &self.payload {
            FbspPayload::Errors(errors) => errors,
            _ => &[],
        }
    }

    /// Payload frames of a REQUEST/REPLY/DATA message.
    pub fn frames(&self) -> &[Bytes] {
        match &self.payload {
            FbspPayload::Frames(frames) => frames,
            FbspPayload::State { frames, .. } => frames,
            _ => &[],
        }
    }

    /// Record an error chain into an ERROR message.
    pub fn note_error(&mut self, err: &Error) {
        debug_assert!(self.msg_type == MsgType::Error);
        if let FbspPayload::Errors(errors) = &mut self.payload {
            errors.extend(ErrorDescription::from_error_chain(err));
        }
    }
}

/// Verify that frames form a valid FBSP message.
///
/// # Errors
///
/// Returns an invalid-message error on: empty message, header of
/// wrong length, unknown FourCC, version mismatch, reserved flag
/// bits, illegal message type, unknown ERROR code or illegal
/// relates-to type, undecodable dataframes, or illegal payload frame
/// counts.
pub fn validate(frames: &Zmsg) -> Result<()> {
    if frames.is_empty() {
        return Err(Error::invalid("empty message"));
    }
    let header = &frames[0];
    if header.len() != HEADER_LEN {
        return Err(Error::invalid("message header must be 16 bytes long"));
    }
    if &header[..4] != FOURCC {
        return Err(Error::invalid("invalid FourCC"));
    }
    if header[4] & VERSION_MASK != REVISION {
        return Err(Error::invalid("invalid protocol version"));
    }
    let Some(flags) = MsgFlags::from_wire(header[5]) else {
        return Err(Error::invalid("invalid flags"));
    };
    let msg_type = MsgType::from_wire(header[4] >> 3)
        .ok_or_else(|| Error::invalid(format!("illegal message type {}", header[4] >> 3)))?;
    let type_data = u16::from_be_bytes([header[6], header[7]]);
    if flags.has(MsgFlags::ACK_REPLY) {
        // An ACK-REPLY has no body.
        return Ok(());
    }
    match msg_type {
        MsgType::Error => {
            if ErrorCode::from_wire(type_data >> 5).is_none() {
                return Err(Error::invalid(format!("unknown ERROR code: {}", type_data >> 5)));
            }
            let relates_to = (type_data & ERROR_TYPE_MASK) as u8;
            if !matches!(relates_to, 0 | 1 | 4 | 6 | 7) {
                return Err(Error::invalid("invalid request code in ERROR message"));
            }
            for (index, frame) in frames[1..].iter().enumerate() {
                payload::decode::<ErrorDescription>(frame).map_err(|_| {
                    Error::invalid(format!("invalid ERROR message data frame: {index}"))
                })?;
            }
        }
        MsgType::Hello => {
            let frame = frames
                .get(1)
                .ok_or_else(|| Error::invalid("invalid HELLO message data frame"))?;
            payload::decode::<HelloDataframe>(frame)
                .map_err(|_| Error::invalid("invalid HELLO message data frame"))?;
        }
        MsgType::Welcome => {
            let frame = frames
                .get(1)
                .ok_or_else(|| Error::invalid("invalid WELCOME message data frame"))?;
            payload::decode::<WelcomeDataframe>(frame)
                .map_err(|_| Error::invalid("invalid WELCOME message data frame"))?;
        }
        MsgType::Noop => {
            if frames.len() > 1 {
                return Err(Error::invalid("data frames not allowed for NOOP message"));
            }
        }
        MsgType::Cancel => {
            if frames.len() != 2 {
                return Err(Error::invalid("CANCEL message must have exactly one data frame"));
            }
            payload::decode::<CancelRequests>(&frames[1])
                .map_err(|_| Error::invalid("invalid CANCEL message data frame"))?;
        }
        MsgType::State => {
            let frame = frames
                .get(1)
                .ok_or_else(|| Error::invalid("invalid STATE message data frame"))?;
            payload::decode::<StateInformation>(frame)
                .map_err(|_| Error::invalid("invalid STATE message data frame"))?;
        }
        _ => {}
    }
    Ok(())
}

impl ProtocolMessage for FbspMessage {
    type Key = DispatchKey<MsgType>;

    fn from_frames(frames: &Zmsg) -> Result<Self> {
        validate(frames)?;
        let header = &frames[0];
        let msg_type = MsgType::from_wire(header[4] >> 3)
            .ok_or_else(|| Error::invalid("illegal message type"))?;
        let flags = MsgFlags::from_wire(header[5])
            .ok_or_else(|| Error::invalid("invalid flags"))?;
        let type_data = u16::from_be_bytes([header[6], header[7]]);
        let mut token = Token::default();
        token.copy_from_slice(&header[8..16]);
        let payload = if flags.has(MsgFlags::ACK_REPLY) {
            FbspPayload::None
        } else {
            match msg_type {
                MsgType::Hello => FbspPayload::Hello(payload::decode(&frames[1])?),
                MsgType::Welcome => FbspPayload::Welcome(payload::decode(&frames[1])?),
                MsgType::Request | MsgType::Reply | MsgType::Data => {
                    FbspPayload::Frames(frames[1..].to_vec())
                }
                MsgType::Cancel => FbspPayload::Cancel(payload::decode(&frames[1])?),
                MsgType::State => FbspPayload::State {
                    info: payload::decode(&frames[1])?,
                    frames: frames[2..].to_vec(),
                },
                MsgType::Error => {
                    let mut errors = Vec::new();
                    for frame in &frames[1..] {
                        errors.push(payload::decode(frame)?);
                    }
                    FbspPayload::Errors(errors)
                }
                _ => FbspPayload::None,
            }
        };
        Ok(Self { msg_type, flags, type_data, token, payload })
    }

    fn to_frames(&self) -> Zmsg {
        let mut frames: Zmsg = vec![Bytes::copy_from_slice(&self.header())];
        if self.flags.has(MsgFlags::ACK_REPLY) {
            return frames;
        }
        match &self.payload {
            FbspPayload::Hello(data) => frames.push(payload::encode(data)),
            FbspPayload::Welcome(data) => frames.push(payload::encode(data)),
            FbspPayload::Frames(data) => frames.extend(data.iter().cloned()),
            FbspPayload::Cancel(data) => frames.push(payload::encode(data)),
            FbspPayload::State { info, frames: extra } => {
                frames.push(payload::encode(info));
                frames.extend(extra.iter().cloned());
            }
            FbspPayload::Errors(errors) => {
                frames.extend(errors.iter().map(payload::encode));
            }
            FbspPayload::None => {}
        }
        frames
    }

    fn keys(&self) -> Vec<Self::Key> {
        vec![DispatchKey::Exact(self.msg_type), DispatchKey::Any]
    }

    fn clear(&mut self) {
        self.flags = MsgFlags::NONE;
        self.type_data = 0;
        self.token = Token::default();
        self.payload = FbspPayload::None;
    }
}

/// FBSP session holding information about the attached peer.
#[derive(Debug)]
pub struct FbspSession {
    base: SessionBase,
    /// HELLO (for service sessions) or WELCOME (for client sessions)
    /// received during the handshake.
    pub greeting: Option<FbspMessage>,
    /// Client peer ID for services, service agent ID for clients.
    pub partner_uid: Option<Uuid>,
}

impl From<SessionBase> for FbspSession {
    fn from(base: SessionBase) -> Self {
        Self { base, greeting: None, partner_uid: None }
    }
}

impl Session for FbspSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SessionBase {
        &mut self.base
    }
}

/// Events of the service side, implemented by the service logic.
pub trait FbspServiceEvents: 'static {
    /// A client sent HELLO. Reject it by returning a stop with the
    /// error code for the ERROR reply.
    fn on_accept_client(&mut self, channel: &mut ChannelCore, msg: &FbspMessage) -> Result<()> {
        let _ = (channel, msg);
        Ok(())
    }

    /// A CANCEL arrived. Per protocol the service must answer with an
    /// ERROR; return a stop with [`ErrorCode::RequestCancelled`] when
    /// the request was cancelled successfully.
    fn on_cancel(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Err(Error::stop(
            ErrorCode::NotImplemented.as_u16(),
            "request cancellation not supported",
        ))
    }

    /// A NOOP arrived (after its ACK-REPLY, when requested, was sent).
    fn on_noop(&mut self, channel: &mut ChannelCore, session: &mut FbspSession) -> Result<()> {
        let _ = (channel, session);
        Ok(())
    }

    /// A DATA message arrived. The handler must acknowledge when the
    /// message requests it. Unexpected DATA is a protocol violation.
    fn on_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Err(Error::stop(ErrorCode::ProtocolViolation.as_u16(), "unexpected DATA message"))
    }

    /// An ACK-REPLY (NOOP, DATA, REPLY or STATE) arrived.
    fn on_ack_received(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// A CLOSE was received or sent; release any resources associated
    /// with the session. Must not fail: the session is discarded right
    /// after.
    fn on_session_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) {
        let _ = (channel, session, msg);
    }

    /// A message handler failed (the ERROR reply was already sent).
    fn on_exception(&mut self, channel: &mut ChannelCore, msg: &FbspMessage, err: &Error) {
        let _ = (channel, msg, err);
    }
}

/// API request handler registered with a service.
pub type ApiHandler<E> =
    fn(&mut E, &mut ChannelCore, &mut FbspSession, &FbspMessage) -> Result<()>;

/// FBSP service side.
pub struct FbspService<E: FbspServiceEvents> {
    handlers: HandlerMap<Self>,
    api_handlers: HashMap<u16, ApiHandler<E>>,
    apis: Vec<Uuid>,
    welcome_df: WelcomeDataframe,
    /// Attached service logic.
    pub events: E,
}

impl<E: FbspServiceEvents> FbspService<E> {
    /// Service protocol for `service`, announced as `peer`.
    pub fn new(service: &ServiceDescriptor, peer: &PeerDescriptor, events: E) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Hello), Self::handle_hello as _);
        handlers.set(DispatchKey::Exact(MsgType::Request), Self::handle_request as _);
        handlers.set(DispatchKey::Exact(MsgType::Cancel), Self::handle_cancel as _);
        handlers.set(DispatchKey::Exact(MsgType::Noop), Self::handle_noop as _);
        handlers.set(DispatchKey::Exact(MsgType::Data), Self::handle_data as _);
        handlers.set(DispatchKey::Exact(MsgType::Close), Self::handle_close as _);
        handlers.set(DispatchKey::Exact(MsgType::Reply), Self::handle_ack_reply as _);
        handlers.set(DispatchKey::Exact(MsgType::State), Self::handle_ack_reply as _);
        handlers.set(DispatchKey::Exact(MsgType::Welcome), Self::handle_unexpected as _);
        let apis: Vec<Uuid> = service.api.iter().map(|intf| intf.uid).collect();
        let welcome_df = WelcomeDataframe {
            instance: PeerInfo::from(peer),
            service: AgentInfo::from(&service.agent),
            api: service
                .api
                .iter()
                .enumerate()
                .map(|(number, intf)| InterfaceSpec {
                    number: number as u16,
                    uid: intf.uid,
                })
                .collect(),
        };
        Self {
            handlers,
            api_handlers: HashMap::new(),
            apis,
            welcome_df,
            events,
        }
    }

    /// Register a handler for REQUEST messages of one service API.
    ///
    /// # Errors
    ///
    /// Returns a service error when the interface is not part of the
    /// service's advertised API.
    pub fn register_api_handler(
        &mut self,
        interface_uid: Uuid,
        api_code: u8,
        handler: ApiHandler<E>,
    ) -> Result<()> {
        let interface_id = self
            .apis
            .iter()
            .position(|uid| *uid == interface_uid)
            .ok_or_else(|| Error::service("interface not advertised by service"))?;
        self.api_handlers
            .insert(request_code(interface_id as u8, api_code), handler);
        Ok(())
    }

    /// Send an ERROR message to the client associated with `rid`.
    pub fn send_error(
        &mut self,
        channel: &mut ChannelCore,
        rid: &RoutingId,
        relates_to: &FbspMessage,
        error_code: ErrorCode,
        err: Option<&Error>,
    ) {
        let mut msg = FbspMessage::error_for(relates_to, error_code);
        if let Some(err) = err {
            msg.note_error(err);
        }
        if let Err(send_err) = channel.send_frames(&msg.to_frames(), rid) {
            tracing::warn!(channel = channel.name(), error = %send_err, "ERROR send failed");
        }
    }

    /// Send CLOSE to the client associated with `rid` and invoke the
    /// session-closed hook with the client's HELLO greeting.
    pub fn send_close(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
    ) -> Result<()> {
        let Some(session) = sessions.get_mut(rid) else {
            return Err(Error::channel("no session to close"));
        };
        let token = session
            .greeting
            .as_ref()
            .map(|greeting| greeting.token)
            .unwrap_or_default();
        let msg = FbspMessage::new(MsgType::Close, token, 0);
        let sent = channel.send_frames(&msg.to_frames(), rid);
        let greeting = session.greeting.clone().unwrap_or_else(|| msg.clone());
        self.events.on_session_closed(channel, session, &greeting);
        sent
    }

    /// Close all connections to attached clients.
    ///
    /// Send errors are ignored; the peer may already be gone.
    pub fn close(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
    ) {
        for rid in sessions.routing_ids() {
            if let Err(err) = self.send_close(channel, sessions, &rid) {
                tracing::debug!(channel = channel.name(), error = %err, "CLOSE send failed");
            }
            sessions.remove(&rid);
        }
    }

    fn handle_hello(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for HELLO message"))?;
        if session.greeting.is_some() {
            return Err(Error::stop(
                ErrorCode::ProtocolViolation.as_u16(),
                "out of band HELLO message",
            ));
        }
        if let FbspPayload::Hello(hello) = &msg.payload {
            session.partner_uid = Some(hello.instance.uid);
        }
        session.greeting = Some(msg.clone());
        let mut welcome = FbspMessage::new(MsgType::Welcome, msg.token, 0);
        welcome.payload = FbspPayload::Welcome(proto.welcome_df.clone());
        channel.send_frames(&welcome.to_frames(), rid)?;
        Ok(None)
    }

    fn handle_request(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for REQUEST message"))?;
        let Some(handler) = proto.api_handlers.get(&msg.type_data).copied() else {
            return Err(Error::stop(ErrorCode::NotImplemented.as_u16(), "API not implemented"));
        };
        handler(&mut proto.events, channel, session, msg)?;
        Ok(None)
    }

    fn handle_cancel(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for CANCEL message"))?;
        // The hook must end in a stop carrying the ERROR code to report.
        proto.events.on_cancel(channel, session, msg)?;
        Ok(None)
    }

    fn handle_noop(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for NOOP message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
            return Ok(None);
        }
        if msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), rid)?;
        }
        proto.events.on_noop(channel, session)?;
        Ok(None)
    }

    fn handle_data(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for DATA message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
            return Ok(None);
        }
        proto.events.on_data(channel, session, msg)?;
        Ok(None)
    }

    fn handle_close(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        if let Some(session) = sessions.get_mut(rid) {
            proto.events.on_session_closed(channel, session, msg);
        }
        discard_session(channel, sessions, rid);
        Ok(None)
    }

    fn handle_ack_reply(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for ACK-REPLY message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
            Ok(None)
        } else {
            Err(Error::stop(
                ErrorCode::ProtocolViolation.as_u16(),
                "clients can send this message type only as ACK-REPLY",
            ))
        }
    }

    fn handle_unexpected(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        _rid: &RoutingId,
        _msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        Err(Error::stop(ErrorCode::ProtocolViolation.as_u16(), "unexpected message"))
    }
}

impl<E: FbspServiceEvents> Protocol for FbspService<E> {
    type Session = FbspSession;
    type Message = FbspMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn validate(&self, frames: &Zmsg) -> Result<()> {
        validate(frames)
    }

    fn accept_new_session(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> bool {
        // Only HELLO may initiate a session; the client acceptance hook
        // may reject with an error code of its own.
        let refusal = if msg.msg_type == MsgType::Hello {
            match self.events.on_accept_client(channel, msg) {
                Ok(()) => None,
                Err(err) => {
                    let code = err
                        .stop_code()
                        .and_then(ErrorCode::from_wire)
                        .unwrap_or(ErrorCode::InternalError);
                    Some((code, Some(err)))
                }
            }
        } else {
            Some((ErrorCode::ProtocolViolation, None))
        };
        match refusal {
            None => true,
            Some((code, err)) => {
                self.send_error(channel, rid, msg, code, err.as_ref());
                false
            }
        }
    }

    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
        err: &Error,
    ) {
        let error_code = err
            .stop_code()
            .and_then(ErrorCode::from_wire)
            .unwrap_or(ErrorCode::InternalError);
        self.send_error(channel, rid, msg, error_code, Some(err));
        self.events.on_exception(channel, msg, err);
    }
}

/// Raw FBSP client side.
///
/// A lightweight decoder for clients that drive
/// [`Channel::receive`](ferrobus_core::channel::Channel::receive)
/// directly and process the returned messages themselves. It captures
/// the WELCOME, auto-acknowledges STATE, discards the session on
/// CLOSE, and rejects HELLO/CANCEL from a service.
pub struct FbspClient {
    handlers: HandlerMap<Self>,
    apis: HashMap<Uuid, u8>,
}

impl Default for FbspClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FbspClient {
    /// New raw client protocol.
    pub fn new() -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Welcome), Self::handle_welcome as _);
        handlers.set(DispatchKey::Exact(MsgType::Noop), Self::handle_noop as _);
        handlers.set(DispatchKey::Exact(MsgType::Close), Self::handle_close as _);
        handlers.set(DispatchKey::Exact(MsgType::Hello), Self::handle_unexpected as _);
        handlers.set(DispatchKey::Exact(MsgType::Cancel), Self::handle_unexpected as _);
        handlers.set(DispatchKey::Any, Self::handle_passthrough as _);
        Self { handlers, apis: HashMap::new() }
    }

    /// Returns true if the attached service advertises `interface_uid`.
    pub fn has_api(&self, interface_uid: &Uuid) -> bool {
        self.apis.contains_key(interface_uid)
    }

    /// New REQUEST message for an API call, using the interface
    /// numbering advertised by the service in its WELCOME.
    ///
    /// # Errors
    ///
    /// Returns a service error when the interface is not advertised.
    pub fn create_request_for(
        &self,
        interface_uid: &Uuid,
        api_code: u8,
        token: Token,
    ) -> Result<FbspMessage> {
        let interface_id = self
            .apis
            .get(interface_uid)
            .copied()
            .ok_or_else(|| Error::service("interface not advertised by service"))?;
        Ok(FbspMessage::new(
            MsgType::Request,
            token,
            request_code(interface_id, api_code),
        ))
    }

    /// Send a HELLO introducing `agent`/`peer` to the service.
    pub fn send_hello(
        &mut self,
        channel: &mut ChannelCore,
        rid: &RoutingId,
        agent: &AgentDescriptor,
        peer: &PeerDescriptor,
        token: Token,
    ) -> Result<()> {
        let mut msg = FbspMessage::new(MsgType::Hello, token, 0);
        msg.payload = FbspPayload::Hello(HelloDataframe {
            instance: PeerInfo::from(peer),
            client: AgentInfo::from(agent),
        });
        channel.send_frames(&msg.to_frames(), rid)
    }

    /// Send a CLOSE for the session greeting's token.
    pub fn send_close(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
    ) -> Result<()> {
        let token = sessions
            .get(rid)
            .and_then(|session| session.greeting.as_ref().map(|greeting| greeting.token))
            .unwrap_or_default();
        let msg = FbspMessage::new(MsgType::Close, token, 0);
        channel.send_frames(&msg.to_frames(), rid)
    }

    /// A service error built from a received ERROR message.
    pub fn exception_for(&self, msg: &FbspMessage) -> Error {
        let mut lines = vec![format!(
            "{:?}, relates to {:?}",
            msg.error_code(),
            msg.relates_to()
        )];
        for err in msg.errors() {
            lines.push(format!("#{:?}: {}", err.code, err.description));
        }
        Error::service(lines.join("\n"))
    }

    fn capture_welcome(
        apis: &mut HashMap<Uuid, u8>,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) {
        if let FbspPayload::Welcome(welcome) = &msg.payload {
            session.partner_uid = Some(welcome.service.uid);
            for intf in &welcome.api {
                apis.insert(intf.uid, intf.number as u8);
            }
        }
        session.greeting = Some(msg.clone());
    }

    fn handle_welcome(
        proto: &mut Self,
        _channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for WELCOME message"))?;
        Self::capture_welcome(&mut proto.apis, session, msg);
        Ok(Some(msg.clone()))
    }

    fn handle_passthrough(
        _proto: &mut Self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        if msg.msg_type == MsgType::State && msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), rid)?;
        }
        Ok(Some(msg.clone()))
    }

    fn handle_noop(
        _proto: &mut Self,
        channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        if msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), rid)?;
        }
        Ok(None)
    }

    fn handle_close(
        _proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        discard_session(channel, sessions, rid);
        Ok(Some(msg.clone()))
    }

    fn handle_unexpected(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        _rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        Err(Error::invalid(format!("unexpected {:?} message from service", msg.msg_type)))
    }
}

impl Protocol for FbspClient {
    type Session = FbspSession;
    type Message = FbspMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn validate(&self, frames: &Zmsg) -> Result<()> {
        validate(frames)
    }

    fn connect_with_session(&self, _channel: &ChannelCore) -> bool {
        // The client must send HELLO to initiate transmission.
        true
    }
}

/// Events of the event-driven client side.
pub trait FbspClientEvents: 'static {
    /// The WELCOME arrived; the service connection is established.
    /// API handlers for REPLY messages are typically registered here.
    fn on_service_connected(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// A REPLY without registered API handler arrived.
    fn on_reply(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// A DATA message arrived. The handler must acknowledge when the
    /// message requests it; the default implementation does exactly
    /// that and drops the payload.
    fn on_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        if msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), session_rid(session))?;
        }
        Ok(())
    }

    /// A STATE message arrived (its ACK-REPLY, when requested, was
    /// already sent).
    fn on_state(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// An ERROR message arrived.
    fn on_error(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// A NOOP arrived (after its ACK-REPLY, when requested, was sent).
    fn on_noop(&mut self, channel: &mut ChannelCore, session: &mut FbspSession) -> Result<()> {
        let _ = (channel, session);
        Ok(())
    }

    /// An ACK-REPLY arrived.
    fn on_ack_received(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Ok(())
    }

    /// A CLOSE was received; release any resources associated with the
    /// session. Must not fail: the session is discarded right after.
    fn on_session_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbspSession,
        msg: &FbspMessage,
    ) {
        let _ = (channel, session, msg);
    }
}

fn session_rid(session: &FbspSession) -> &RoutingId {
    &session.base().routing_id
}

/// Event-driven FBSP client side.
///
/// For clients hosted in a central I/O loop: incoming messages are
/// processed uniformly and routed to the [`FbspClientEvents`] hooks
/// and registered per-API handlers.
pub struct FbspEventClient<E: FbspClientEvents> {
    handlers: HandlerMap<Self>,
    apis: HashMap<Uuid, u8>,
    api_handlers: HashMap<u16, ApiHandler<E>>,
    /// Attached client logic.
    pub events: E,
}

impl<E: FbspClientEvents> FbspEventClient<E> {
    /// Event client protocol driving `events`.
    pub fn new(events: E) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Welcome), Self::handle_welcome as _);
        handlers.set(DispatchKey::Exact(MsgType::Error), Self::handle_error as _);
        handlers.set(DispatchKey::Exact(MsgType::Reply), Self::handle_reply as _);
        handlers.set(DispatchKey::Exact(MsgType::State), Self::handle_state as _);
        handlers.set(DispatchKey::Exact(MsgType::Noop), Self::handle_noop as _);
        handlers.set(DispatchKey::Exact(MsgType::Data), Self::handle_data as _);
        handlers.set(DispatchKey::Exact(MsgType::Close), Self::handle_close as _);
        handlers.set(DispatchKey::Exact(MsgType::Request), Self::handle_ack_reply as _);
        handlers.set(DispatchKey::Exact(MsgType::Hello), Self::handle_unexpected as _);
        handlers.set(DispatchKey::Exact(MsgType::Cancel), Self::handle_unexpected as _);
        Self {
            handlers,
            apis: HashMap::new(),
            api_handlers: HashMap::new(),
            events,
        }
    }

    /// Register a handler for REPLY messages of one service API.
    ///
    /// # Errors
    ///
    /// Returns a service error when the interface was not advertised
    /// by the service (so registration must happen after WELCOME,
    /// typically in
    /// [`on_service_connected`](FbspClientEvents::on_service_connected)).
    pub fn register_api_handler(
        &mut self,
        interface_uid: Uuid,
        api_code: u8,
        handler: ApiHandler<E>,
    ) -> Result<()> {
        let interface_id = self
            .apis
            .get(&interface_uid)
            .copied()
            .ok_or_else(|| Error::service("interface not advertised by service"))?;
        self.api_handlers
            .insert(request_code(interface_id, api_code), handler);
        Ok(())
    }

    /// New REQUEST message for an API call.
    ///
    /// # Errors
    ///
    /// Returns a service error when the interface is not advertised.
    pub fn create_request_for(
        &self,
        interface_uid: &Uuid,
        api_code: u8,
        token: Token,
    ) -> Result<FbspMessage> {
        let interface_id = self
            .apis
            .get(interface_uid)
            .copied()
            .ok_or_else(|| Error::service("interface not advertised by service"))?;
        Ok(FbspMessage::new(
            MsgType::Request,
            token,
            request_code(interface_id, api_code),
        ))
    }

    /// Send a HELLO introducing `agent`/`peer` to the service.
    pub fn send_hello(
        &mut self,
        channel: &mut ChannelCore,
        rid: &RoutingId,
        agent: &AgentDescriptor,
        peer: &PeerDescriptor,
        token: Token,
    ) -> Result<()> {
        let mut msg = FbspMessage::new(MsgType::Hello, token, 0);
        msg.payload = FbspPayload::Hello(HelloDataframe {
            instance: PeerInfo::from(peer),
            client: AgentInfo::from(agent),
        });
        channel.send_frames(&msg.to_frames(), rid)
    }

    fn handle_welcome(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for WELCOME message"))?;
        FbspClient::capture_welcome(&mut proto.apis, session, msg);
        proto.events.on_service_connected(channel, session, msg)?;
        Ok(None)
    }

    fn handle_error(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for ERROR message"))?;
        proto.events.on_error(channel, session, msg)?;
        Ok(None)
    }

    fn handle_reply(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for REPLY message"))?;
        match proto.api_handlers.get(&msg.type_data).copied() {
            Some(handler) => handler(&mut proto.events, channel, session, msg)?,
            None => proto.events.on_reply(channel, session, msg)?,
        }
        Ok(None)
    }

    fn handle_state(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for STATE message"))?;
        if msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), rid)?;
        }
        proto.events.on_state(channel, session, msg)?;
        Ok(None)
    }

    fn handle_noop(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for NOOP message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
            return Ok(None);
        }
        if msg.has_ack_req() {
            let reply = FbspMessage::ack_reply_for(msg);
            channel.send_frames(&reply.to_frames(), rid)?;
        }
        proto.events.on_noop(channel, session)?;
        Ok(None)
    }

    fn handle_data(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for DATA message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
            return Ok(None);
        }
        proto.events.on_data(channel, session, msg)?;
        Ok(None)
    }

    fn handle_close(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        if let Some(session) = sessions.get_mut(rid) {
            proto.events.on_session_closed(channel, session, msg);
        }
        discard_session(channel, sessions, rid);
        Ok(None)
    }

    fn handle_ack_reply(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbspSession>,
        rid: &RoutingId,
        msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for ACK-REPLY message"))?;
        if msg.has_ack_reply() {
            proto.events.on_ack_received(channel, session, msg)?;
        }
        Ok(None)
    }

    fn handle_unexpected(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbspSession>,
        _rid: &RoutingId,
        _msg: &FbspMessage,
    ) -> Result<Option<FbspMessage>> {
        Err(Error::stop(ErrorCode::ProtocolViolation.as_u16(), "unexpected message"))
    }
}

impl<E: FbspClientEvents> Protocol for FbspEventClient<E> {
    type Session = FbspSession;
    type Message = FbspMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn validate(&self, frames: &Zmsg) -> Result<()> {
        validate(frames)
    }

    fn connect_with_session(&self, _channel: &ChannelCore) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut msg = FbspMessage::new(MsgType::Request, *b"tokens!!", request_code(1, 9));
        msg.flags.set(MsgFlags::ACK_REQ);
        let decoded = FbspMessage::from_frames(&msg.to_frames()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Request);
        assert_eq!(decoded.token, *b"tokens!!");
        assert_eq!(decoded.interface_id(), 1);
        assert_eq!(decoded.api_code(), 9);
        assert!(decoded.has_ack_req());
        assert_eq!(decoded.header(), msg.header());
    }

    #[test]
    fn test_header_layout() {
        let msg = FbspMessage::new(MsgType::Close, [7u8; 8], 0);
        let header = msg.header();
        assert_eq!(&header[..4], b"FBSP");
        assert_eq!(header[4], (9 << 3) | REVISION);
        assert_eq!(&header[8..16], &[7u8; 8]);
    }

    #[test]
    fn test_error_type_data_packing() {
        let request = FbspMessage::new(MsgType::Request, [1u8; 8], 0x0102);
        let err = FbspMessage::error_for(&request, ErrorCode::NotImplemented);
        assert_eq!(err.error_code(), Some(ErrorCode::NotImplemented));
        assert_eq!(err.relates_to(), Some(MsgType::Request));
        assert_eq!(err.token, request.token);
        assert_eq!(err.type_data, (4 << 5) | 4);
    }

    #[test]
    fn test_ack_reply_has_no_body() {
        let mut hello = FbspMessage::new(MsgType::Hello, [0u8; 8], 0);
        hello.flags.set(MsgFlags::ACK_REQ);
        let reply = FbspMessage::ack_reply_for(&hello);
        assert!(reply.has_ack_reply());
        assert!(!reply.has_ack_req());
        assert_eq!(reply.to_frames().len(), 1);
        // and it parses back without a payload requirement
        let decoded = FbspMessage::from_frames(&reply.to_frames()).unwrap();
        assert!(matches!(decoded.payload, FbspPayload::None));
    }

    #[test]
    fn test_validate_rejects_bad_header() {
        assert!(validate(&vec![]).is_err());
        assert!(validate(&vec![Bytes::from_static(b"FBSPshort")]).is_err());

        let msg = FbspMessage::new(MsgType::Noop, [0u8; 8], 0);
        let mut frames = msg.to_frames();
        let mut raw = frames[0].to_vec();
        raw[0] = b'X';
        frames[0] = Bytes::from(raw);
        assert!(validate(&frames).is_err());

        let mut frames = msg.to_frames();
        let mut raw = frames[0].to_vec();
        raw[5] = 0x08;
        frames[0] = Bytes::from(raw);
        assert!(validate(&frames).is_err());

        let mut frames = msg.to_frames();
        let mut raw = frames[0].to_vec();
        raw[4] = (12 << 3) | REVISION;
        frames[0] = Bytes::from(raw);
        assert!(validate(&frames).is_err());
    }

    #[test]
    fn test_validate_error_relates_to() {
        // ERROR relating to REPLY (5) is illegal
        let mut msg = FbspMessage::new(MsgType::Error, [0u8; 8], 0);
        msg.type_data = (ErrorCode::Error.as_u16() << 5) | 5;
        assert!(validate(&msg.to_frames()).is_err());

        // relating to REQUEST is fine
        let mut msg = FbspMessage::new(MsgType::Error, [0u8; 8], 0);
        msg.type_data = (ErrorCode::Error.as_u16() << 5) | 4;
        assert!(validate(&msg.to_frames()).is_ok());

        // unknown error code
        let mut msg = FbspMessage::new(MsgType::Error, [0u8; 8], 0);
        msg.type_data = (999 << 5) | 4;
        assert!(validate(&msg.to_frames()).is_err());
    }

    #[test]
    fn test_validate_noop_payload() {
        let msg = FbspMessage::new(MsgType::Noop, [0u8; 8], 0);
        let mut frames = msg.to_frames();
        frames.push(Bytes::from_static(b"extra"));
        assert!(validate(&frames).is_err());
    }

    #[test]
    fn test_hello_dataframe_roundtrip() {
        let peer = PeerDescriptor::new(Uuid::new_v4());
        let agent = AgentDescriptor::new(
            Uuid::new_v4(),
            "test-client",
            "1.0.0",
            ferrobus_core::types::VENDOR_UID,
            "test/client",
        );
        let mut msg = FbspMessage::new(MsgType::Hello, *b"hello!!!", 0);
        msg.payload = FbspPayload::Hello(HelloDataframe {
            instance: PeerInfo::from(&peer),
            client: AgentInfo::from(&agent),
        });
        let decoded = FbspMessage::from_frames(&msg.to_frames()).unwrap();
        let FbspPayload::Hello(hello) = decoded.payload else {
            panic!("expected HELLO payload");
        };
        assert_eq!(hello.instance.uid, peer.uid);
        assert_eq!(hello.client.name, "test-client");
    }

    #[test]
    fn test_state_message() {
        let request = FbspMessage::new(MsgType::Request, [3u8; 8], request_code(0, 1));
        let state = FbspMessage::state_for(&request, State::Running);
        let decoded = FbspMessage::from_frames(&state.to_frames()).unwrap();
        let FbspPayload::State { info, .. } = decoded.payload else {
            panic!("expected STATE payload");
        };
        assert_eq!(State::from_wire(info.state), Some(State::Running));
        assert_eq!(decoded.type_data, request.type_data);
    }
}
