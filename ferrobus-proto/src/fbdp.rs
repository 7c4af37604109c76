//! FBDP: the flow-controlled data-pipe protocol.
//!
//! FBDP moves user data over a single pipe between a *server* (the
//! side that binds) and a *client* (the side that connects); either
//! side can be the producer. Transmission is credit-based: the server
//! grants a batch with `READY(n)`, the client confirms with
//! `READY(min(n, own limit))`, and both sides count the remaining
//! credit down on every DATA message until a new batch is negotiated.
//!
//! Wire layout: an 8-byte control frame
//! `"FBDP" | control_byte | flags | type_data(u16 BE)` where the low
//! 3 bits of `control_byte` carry the protocol revision and the high
//! 5 bits the message type. OPEN carries one dataframe, DATA at most
//! one payload frame, CLOSE zero or more error descriptions.

use bytes::Bytes;

use ferrobus_core::channel::ChannelCore;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::message::Zmsg;
use ferrobus_core::protocol::{
    discard_session, DispatchKey, HandlerMap, Protocol, ProtocolMessage,
};
use ferrobus_core::session::{Session, SessionBase, SessionStore};
use ferrobus_core::types::{PipeSocket, RoutingId};
use hashbrown::HashMap;

use crate::payload::{self, ErrorDescription, OpenDataframe};

/// FBDP protocol identification (FourCC).
pub const FOURCC: &[u8; 4] = b"FBDP";
/// FBDP protocol revision.
pub const REVISION: u8 = 1;
/// FBDP control frame length.
pub const HEADER_LEN: usize = 8;
/// Protocol version mask in the control byte.
pub const VERSION_MASK: u8 = 7;
/// Default data batch size.
pub const DATA_BATCH_SIZE: u16 = 50;

/// FBDP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Initial message from client.
    Open = 1,
    /// Transfer negotiation message.
    Ready = 2,
    /// No operation, used for keep-alive & ping purposes.
    Noop = 3,
    /// User data.
    Data = 4,
    /// Sent by the peer that is going to close the connection.
    Close = 5,
}

impl MsgType {
    /// Decode from the control byte's type bits.
    pub fn from_wire(value: u8) -> Option<MsgType> {
        Some(match value {
            1 => MsgType::Open,
            2 => MsgType::Ready,
            3 => MsgType::Noop,
            4 => MsgType::Data,
            5 => MsgType::Close,
            _ => return None,
        })
    }
}

/// FBDP message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(u8);

impl MsgFlags {
    /// No flags.
    pub const NONE: MsgFlags = MsgFlags(0);
    /// Sender requests an acknowledgement.
    pub const ACK_REQ: MsgFlags = MsgFlags(1);
    /// Message is an acknowledgement.
    pub const ACK_REPLY: MsgFlags = MsgFlags(2);

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Decode flags; reserved bits are rejected.
    pub fn from_wire(value: u8) -> Option<MsgFlags> {
        if value & !3 != 0 {
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

/// FBDP error codes carried in CLOSE messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// No error: normal end of stream.
    Ok = 0,
    /// A formal error was detected in a message.
    InvalidMessage = 1,
    /// Peer violated the protocol rules.
    ProtocolViolation = 2,
    /// General error.
    Error = 3,
    /// Unexpected internal failure.
    InternalError = 4,
    /// Transmitted data are invalid.
    InvalidData = 5,
    /// Transmission timed out.
    Timeout = 6,
    /// Requested pipe endpoint is not available.
    PipeEndpointUnavailable = 100,
    /// Peer requires an unsupported protocol version.
    FbdpVersionNotSupported = 101,
    /// Requested operation is not implemented.
    NotImplemented = 102,
    /// Requested data format is not supported.
    DataFormatNotSupported = 103,
}

impl ErrorCode {
    /// Decode from the wire value.
    pub fn from_wire(value: u16) -> Option<ErrorCode> {
        Some(match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::InvalidMessage,
            2 => ErrorCode::ProtocolViolation,
            3 => ErrorCode::Error,
            4 => ErrorCode::InternalError,
            5 => ErrorCode::InvalidData,
            6 => ErrorCode::Timeout,
            100 => ErrorCode::PipeEndpointUnavailable,
            101 => ErrorCode::FbdpVersionNotSupported,
            102 => ErrorCode::NotImplemented,
            103 => ErrorCode::DataFormatNotSupported,
            _ => return None,
        })
    }

    /// The wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Payload attached to an FBDP message, by message type.
#[derive(Debug, Clone, Default)]
pub enum FbdpPayload {
    /// READY and NOOP carry no payload.
    #[default]
    None,
    /// OPEN carries one dataframe.
    Open(OpenDataframe),
    /// DATA carries at most one payload frame.
    Data(Option<Bytes>),
    /// CLOSE carries zero or more error descriptions.
    Close(Vec<ErrorDescription>),
}

/// FBDP protocol message.
#[derive(Debug, Clone)]
pub struct FbdpMessage {
    /// Type of message.
    pub msg_type: MsgType,
    /// Message flags.
    pub flags: MsgFlags,
    /// Type-specific control data: batch size for READY, a free tag
    /// for DATA, an [`ErrorCode`] for CLOSE.
    pub type_data: u16,
    /// Payload of the message.
    pub payload: FbdpPayload,
}

impl FbdpMessage {
    /// Message of the given type with default payload.
    pub fn new(msg_type: MsgType, type_data: u16) -> Self {
        let payload = match msg_type {
            MsgType::Open => FbdpPayload::Open(OpenDataframe::default()),
            MsgType::Data => FbdpPayload::Data(None),
            MsgType::Close => FbdpPayload::Close(Vec::new()),
            _ => FbdpPayload::None,
        };
        Self { msg_type, flags: MsgFlags::NONE, type_data, payload }
    }

    /// New DATA message.
    pub fn data(payload: Option<Bytes>) -> Self {
        let mut msg = Self::new(MsgType::Data, 0);
        msg.payload = FbdpPayload::Data(payload);
        msg
    }

    /// New CLOSE message for an error code.
    pub fn close(code: u16) -> Self {
        Self::new(MsgType::Close, code)
    }

    /// New ACK-REPLY answering `msg`.
    pub fn ack_reply_for(msg: &FbdpMessage) -> Self {
        let mut reply = Self::new(msg.msg_type, msg.type_data);
        reply.flags = msg.flags;
        reply.flags.clear(MsgFlags::ACK_REQ);
        reply.flags.set(MsgFlags::ACK_REPLY);
        reply.payload = FbdpPayload::None;
        reply
    }

    /// The control frame of this message.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(FOURCC);
        header[4] = ((self.msg_type as u8) << 3) | REVISION;
        header[5] = self.flags.bits();
        header[6..8].copy_from_slice(&self.type_data.to_be_bytes());
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

    /// The data frame of a DATA message.
    pub fn data_frame(&self) -> Option<&Bytes> {
        match &self.payload {
            FbdpPayload::Data(frame) => frame.as_ref(),
            _ => None,
        }
    }

    /// Error descriptions of a CLOSE message.
    pub fn errors(&self) -> &[ErrorDescription] {
        match &self.payload {
            FbdpPayload::Close(errors) => errors,
            _ => &[],
        }
    }

    /// Record an error chain into a CLOSE message.
    pub fn note_error(&mut self, err: &Error) {
        debug_assert!(self.msg_type == MsgType::Close);
        if let FbdpPayload::Close(errors) = &mut self.payload {
            errors.extend(ErrorDescription::from_error_chain(err));
        }
    }
}

/// Verify that frames form a valid FBDP message.
///
/// # Errors
///
/// Returns an invalid-message error on: empty message, header of
/// wrong length, unknown FourCC, version mismatch, reserved flag
/// bits, unknown message type, OPEN without exactly one parsable
/// dataframe (with non-empty pipe, valid socket, non-empty format),
/// a CLOSE error frame without description, more than one DATA
/// payload frame, or payload frames on READY/NOOP.
pub fn validate(frames: &Zmsg) -> Result<()> {
    if frames.is_empty() {
        return Err(Error::invalid("empty message"));
    }
    let header = &frames[0];
    if header.len() != HEADER_LEN {
        return Err(Error::invalid("message header must be 8 bytes long"));
    }
    if &header[..4] != FOURCC {
        return Err(Error::invalid("invalid FourCC"));
    }
    if header[4] & VERSION_MASK != REVISION {
        return Err(Error::invalid("invalid protocol version"));
    }
    if MsgFlags::from_wire(header[5]).is_none() {
        return Err(Error::invalid("invalid flags"));
    }
    let msg_type = MsgType::from_wire(header[4] >> 3)
        .ok_or_else(|| Error::invalid(format!("illegal message type {}", header[4] >> 3)))?;
    match msg_type {
        MsgType::Open => {
            if frames.len() != 2 {
                return Err(Error::invalid("OPEN message must have a dataframe"));
            }
            let open: OpenDataframe = payload::decode(&frames[1])
                .map_err(|_| Error::invalid("invalid data frame for OPEN message"))?;
            if open.data_pipe.is_empty() {
                return Err(Error::invalid("missing 'data_pipe' specification"));
            }
            if PipeSocket::from_wire(open.pipe_socket).is_none() {
                return Err(Error::invalid("invalid 'pipe_socket'"));
            }
            if open.data_format.is_empty() {
                return Err(Error::invalid("missing 'data_format' specification"));
            }
        }
        MsgType::Close => {
            for frame in &frames[1..] {
                let desc: ErrorDescription = payload::decode(frame)?;
                if desc.description.is_empty() {
                    return Err(Error::invalid("missing error description"));
                }
            }
        }
        MsgType::Data => {
            if frames.len() > 2 {
                return Err(Error::invalid("DATA message may have only one data frame"));
            }
        }
        MsgType::Ready | MsgType::Noop => {
            if frames.len() > 1 {
                return Err(Error::invalid(
                    "data frames not allowed for READY and NOOP messages",
                ));
            }
        }
    }
    Ok(())
}

impl ProtocolMessage for FbdpMessage {
    type Key = DispatchKey<MsgType>;

    fn from_frames(frames: &Zmsg) -> Result<Self> {
        validate(frames)?;
        let header = &frames[0];
        let msg_type = MsgType::from_wire(header[4] >> 3)
            .ok_or_else(|| Error::invalid("illegal message type"))?;
        let flags = MsgFlags::from_wire(header[5])
            .ok_or_else(|| Error::invalid("invalid flags"))?;
        let type_data = u16::from_be_bytes([header[6], header[7]]);
        let payload = match msg_type {
            MsgType::Open => FbdpPayload::Open(payload::decode(&frames[1])?),
            MsgType::Data => FbdpPayload::Data(frames.get(1).cloned()),
            MsgType::Close => {
                let mut errors = Vec::new();
                for frame in &frames[1..] {
                    errors.push(payload::decode(frame)?);
                }
                FbdpPayload::Close(errors)
            }
            _ => FbdpPayload::None,
        };
        Ok(Self { msg_type, flags, type_data, payload })
    }

    fn to_frames(&self) -> Zmsg {
        let mut frames: Zmsg = vec![Bytes::copy_from_slice(&self.header())];
        match &self.payload {
            FbdpPayload::Open(open) => frames.push(payload::encode(open)),
            FbdpPayload::Data(Some(data)) => frames.push(data.clone()),
            FbdpPayload::Close(errors) => {
                frames.extend(errors.iter().map(payload::encode));
            }
            _ => {}
        }
        frames
    }

    fn keys(&self) -> Vec<Self::Key> {
        vec![DispatchKey::Exact(self.msg_type), DispatchKey::Any]
    }

    fn clear(&mut self) {
        self.flags = MsgFlags::NONE;
        self.type_data = 0;
        self.payload = FbdpPayload::None;
    }
}

/// FBDP session: information about one data-pipe transmission.
#[derive(Debug)]
pub struct FbdpSession {
    base: SessionBase,
    /// Data pipe identification.
    pub pipe: Option<String>,
    /// Data pipe socket the peer is attached to.
    pub socket: Option<PipeSocket>,
    /// Format of user data transmitted in DATA messages.
    pub data_format: Option<String>,
    /// Data pipe parameters.
    pub params: HashMap<String, String>,
    /// DATA messages that remain to be transmitted since the last
    /// READY message; `None` outside a batch.
    pub transmit: Option<u16>,
    /// Server sent READY and waits for the READY response.
    pub await_ready: bool,
}

impl From<SessionBase> for FbdpSession {
    fn from(base: SessionBase) -> Self {
        Self {
            base,
            pipe: None,
            socket: None,
            data_format: None,
            params: HashMap::new(),
            transmit: None,
            await_ready: false,
        }
    }
}

impl Session for FbdpSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SessionBase {
        &mut self.base
    }
}

/// Shared FBDP transmission options.
#[derive(Debug, Clone)]
pub struct FbdpOptions {
    /// Batch size granted when the ready hook delegates (`-1`).
    pub batch_size: u16,
    /// CONSUMER option: send the ACK-REPLY for DATA/ACK_REQ after
    /// (true) instead of before (false) the data is processed.
    pub confirm_processing: bool,
    /// PRODUCER option: after a DATA with ACK_REQ, send the next DATA
    /// only once the ACK-REPLY arrived.
    pub send_after_confirmed: bool,
}

impl Default for FbdpOptions {
    fn default() -> Self {
        Self {
            batch_size: DATA_BATCH_SIZE,
            confirm_processing: false,
            send_after_confirmed: true,
        }
    }
}

/// Events common to both FBDP sides, implemented by the service logic
/// attached to a pipe channel.
pub trait FbdpEvents: 'static {
    /// PRODUCER: store the next payload into the outgoing DATA
    /// message. May set ACK_REQ and `type_data`. Signal end of data by
    /// returning a stop with [`ErrorCode::Ok`].
    ///
    /// The default implementation ends the stream immediately.
    fn on_produce_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()> {
        let _ = (channel, session, msg);
        Err(Error::stop(ErrorCode::Ok.as_u16(), "OK"))
    }

    /// CONSUMER: process the payload of a received DATA message. The
    /// ACK-REQUEST of the received message is handled by the protocol.
    ///
    /// The default implementation ends the stream immediately.
    fn on_accept_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()> {
        let _ = (channel, session, data);
        Err(Error::stop(ErrorCode::Ok.as_u16(), "OK"))
    }

    /// Availability poll: whether the data source can produce (or the
    /// sink accept) data right now. `None` marks a *stable* source
    /// that always can, suspending is then never needed.
    fn on_get_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<Option<bool>> {
        let _ = (channel, session);
        Ok(None)
    }

    /// PRODUCER: an ACK-REPLY for a sent DATA message arrived.
    fn on_data_confirmed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        type_data: u16,
    ) -> Result<()> {
        let _ = (channel, session, type_data);
        Ok(())
    }

    /// A NOOP arrived (after its ACK-REPLY, when requested, was sent).
    fn on_noop(&mut self, channel: &mut ChannelCore, session: &mut FbdpSession) -> Result<()> {
        let _ = (channel, session);
        Ok(())
    }

    /// A CLOSE message was received or sent; release any resources
    /// associated with the transmission. Must not fail: the session is
    /// discarded right after.
    fn on_pipe_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        let _ = (channel, session, msg, err);
    }

    /// A message handler failed (the pipe was already closed with the
    /// mapped error code).
    fn on_exception(&mut self, channel: &mut ChannelCore, msg: &FbdpMessage, err: &Error) {
        let _ = (channel, msg, err);
    }
}

/// Server-side FBDP events.
pub trait FbdpServerEvents: FbdpEvents {
    /// A client attached to the pipe via OPEN. The session carries the
    /// request data; reject by returning a stop with the code for the
    /// CLOSE message.
    fn on_accept_client(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        let _ = (channel, session);
        Err(Error::stop(ErrorCode::InternalError.as_u16(), "accept handler not defined"))
    }

    /// Batch size for the next transmission: `0` = not ready yet,
    /// `n` = up to n messages, `-1` = the protocol-wide batch size.
    fn on_get_ready(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<i32> {
        if let Some(false) = self.on_get_data(channel, session)? {
            return Ok(0);
        }
        Ok(-1)
    }

    /// Arrange for a READY to be sent later (called when the batch
    /// size was zero). Must be provided when
    /// [`on_get_ready`](Self::on_get_ready) may return zero.
    fn on_schedule_ready(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        let _ = (channel, session);
        Err(Error::stop(ErrorCode::InternalError.as_u16(), "READY scheduler not defined"))
    }
}

/// Client-side FBDP events.
pub trait FbdpClientEvents: FbdpEvents {
    /// Negotiate the batch size offered by the server: `0` = not ready
    /// yet, `n` = up to n messages, `-1` = the protocol-wide batch
    /// size. Used only when smaller than the server's offer.
    fn on_server_ready(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        batch_size: u16,
    ) -> Result<i32> {
        let _ = batch_size;
        if let Some(false) = self.on_get_data(channel, session)? {
            return Ok(0);
        }
        Ok(-1)
    }

    /// Fill additional session information right after
    /// [`send_open`](FbdpClient::send_open).
    fn on_init_session(&mut self, channel: &mut ChannelCore, session: &mut FbdpSession) {
        let _ = (channel, session);
    }
}

/// Internal view shared by the two FBDP protocol halves.
trait Role: Protocol<Session = FbdpSession, Message = FbdpMessage> {
    fn options(&self) -> &FbdpOptions;
    /// Session socket value meaning "data flows to us".
    fn flow_in(&self) -> PipeSocket;
    fn init_new_batch(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
    ) -> Result<()>;
    fn ev_produce_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()>;
    fn ev_accept_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()>;
    fn ev_get_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<Option<bool>>;
    fn ev_data_confirmed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        type_data: u16,
    ) -> Result<()>;
    fn ev_noop(&mut self, channel: &mut ChannelCore, session: &mut FbdpSession) -> Result<()>;
    fn ev_pipe_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    );
    fn ev_exception(&mut self, channel: &mut ChannelCore, msg: &FbdpMessage, err: &Error);
}

fn set_session_wait_out(channel: &mut ChannelCore, session: &mut FbdpSession, value: bool) {
    channel.set_wait_out(value);
    session.set_send_pending(value);
}

/// Send a READY message with the given batch size.
fn send_ready(channel: &mut ChannelCore, rid: &RoutingId, batch_size: u16) -> Result<()> {
    let msg = FbdpMessage::new(MsgType::Ready, batch_size);
    channel
        .send_frames(&msg.to_frames(), rid)
        .map_err(|_| Error::stop(ErrorCode::Error.as_u16(), "broken pipe, can't send READY message"))
}

/// Send CLOSE, fire the close hook, then discard the session.
///
/// The hook runs even when the send failed; the session always
/// disappears.
fn role_send_close<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
    error_code: u16,
    err: Option<&Error>,
) -> Result<()> {
    let mut msg = FbdpMessage::close(error_code);
    if let Some(err) = err {
        msg.note_error(err);
    }
    let sent = channel.send_frames(&msg.to_frames(), rid);
    if let Some(session) = sessions.get_mut(rid) {
        role.ev_pipe_closed(channel, session, &msg, err);
    }
    discard_session(channel, sessions, rid);
    sent
}

fn role_handle_exception<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
    msg: &FbdpMessage,
    err: &Error,
) {
    let error_code = err.stop_code().unwrap_or(ErrorCode::InternalError.as_u16());
    if let Err(close_err) = role_send_close(role, channel, sessions, rid, error_code, Some(err)) {
        tracing::warn!(channel = channel.name(), error = %close_err, "CLOSE send failed");
    }
    role.ev_exception(channel, msg, err);
}

/// Produce and send the next DATA message for a pending session.
fn pump_data<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
) -> Result<()> {
    let mut failure: Option<Error> = None;
    let mut renegotiate = false;
    if let Some(session) = sessions.get_mut(rid) {
        let mut msg = FbdpMessage::data(None);
        match role.ev_produce_data(channel, session, &mut msg) {
            Ok(()) => {
                if let Err(err) = channel.send_frames(&msg.to_frames(), rid) {
                    failure = Some(Error::stop(
                        ErrorCode::Error.as_u16(),
                        format!("broken pipe, can't send DATA message: {err}"),
                    ));
                } else {
                    let remaining = session.transmit.unwrap_or(1).saturating_sub(1);
                    session.transmit = Some(remaining);
                    if remaining > 0 {
                        if msg.has_ack_req() && role.options().send_after_confirmed {
                            set_session_wait_out(channel, session, false);
                        } else {
                            match role.ev_get_data(channel, session) {
                                Ok(Some(false)) => set_session_wait_out(channel, session, false),
                                Ok(_) => {}
                                Err(err) => failure = Some(err),
                            }
                        }
                    } else {
                        set_session_wait_out(channel, session, false);
                        renegotiate = true;
                    }
                }
            }
            Err(err) => failure = Some(err),
        }
    }
    if renegotiate {
        if let Err(err) = role.init_new_batch(channel, sessions, rid) {
            failure = Some(err);
        }
    }
    if let Some(err) = failure {
        let code = err.stop_code().unwrap_or(ErrorCode::InternalError.as_u16());
        let exc = if code == ErrorCode::Ok.as_u16() { None } else { Some(&err) };
        role_send_close(role, channel, sessions, rid, code, exc)?;
    }
    Ok(())
}

fn role_output_ready<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
) -> Result<()> {
    let pending: Vec<RoutingId> = sessions
        .iter()
        .filter(|s| s.send_pending())
        .map(|s| s.routing_id().clone())
        .collect();
    for rid in pending {
        if let Err(err) = pump_data(role, channel, sessions, &rid) {
            role.ev_exception(channel, &FbdpMessage::data(None), &err);
        }
    }
    Ok(())
}

fn role_handle_data<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
    msg: &FbdpMessage,
) -> Result<Option<FbdpMessage>> {
    let flow_in = role.flow_in();
    let mut renegotiate = false;
    {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for DATA message"))?;
        if session.socket == Some(flow_in) {
            // DATA flows to us
            let Some(remaining) = session.transmit else {
                return Err(Error::stop(
                    ErrorCode::ProtocolViolation.as_u16(),
                    "out of band DATA message",
                ));
            };
            if msg.has_ack_req() && !role.options().confirm_processing {
                let reply = FbdpMessage::ack_reply_for(msg);
                channel.send_frames(&reply.to_frames(), rid).map_err(|_| {
                    Error::stop(ErrorCode::Error.as_u16(), "ACK-REPLY send failed")
                })?;
            }
            role.ev_accept_data(channel, session, msg.data_frame())?;
            if msg.has_ack_req() && role.options().confirm_processing {
                let reply = FbdpMessage::ack_reply_for(msg);
                channel.send_frames(&reply.to_frames(), rid).map_err(|_| {
                    Error::stop(ErrorCode::Error.as_u16(), "ACK-REPLY send failed")
                })?;
            }
            let remaining = remaining.saturating_sub(1);
            session.transmit = Some(remaining);
            if remaining == 0 {
                renegotiate = true;
            }
        } else if msg.has_ack_reply() {
            // DATA flows from us; confirmation of an earlier send
            if session.transmit.unwrap_or(0) > 0 && role.options().send_after_confirmed {
                // Re-initiate the transfer via the I/O loop if data are available
                match role.ev_get_data(channel, session)? {
                    Some(false) => {}
                    _ => set_session_wait_out(channel, session, true),
                }
            }
            role.ev_data_confirmed(channel, session, msg.type_data)?;
        } else {
            let socket = flow_in.peer();
            return Err(Error::stop(
                ErrorCode::ProtocolViolation.as_u16(),
                format!("DATA message sent to {socket} socket"),
            ));
        }
    }
    if renegotiate {
        role.init_new_batch(channel, sessions, rid)?;
    }
    Ok(None)
}

fn role_handle_close<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
    msg: &FbdpMessage,
) -> Result<Option<FbdpMessage>> {
    if let Some(session) = sessions.get_mut(rid) {
        role.ev_pipe_closed(channel, session, msg, None);
    }
    discard_session(channel, sessions, rid);
    Ok(None)
}

fn role_handle_noop<R: Role>(
    role: &mut R,
    channel: &mut ChannelCore,
    sessions: &mut SessionStore<FbdpSession>,
    rid: &RoutingId,
    msg: &FbdpMessage,
) -> Result<Option<FbdpMessage>> {
    if msg.has_ack_req() {
        let reply = FbdpMessage::ack_reply_for(msg);
        channel.send_frames(&reply.to_frames(), rid)?;
    }
    if let Some(session) = sessions.get_mut(rid) {
        role.ev_noop(channel, session)?;
    }
    Ok(None)
}

/// FBDP server side: binds the pipe endpoint and grants batches.
pub struct FbdpServer<E: FbdpServerEvents> {
    handlers: HandlerMap<Self>,
    /// Transmission options.
    pub options: FbdpOptions,
    /// Attached service logic.
    pub events: E,
}

impl<E: FbdpServerEvents> FbdpServer<E> {
    /// Server protocol driving `events`.
    pub fn new(events: E) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Open), Self::handle_open);
        handlers.set(DispatchKey::Exact(MsgType::Ready), Self::handle_ready);
        handlers.set(DispatchKey::Exact(MsgType::Data), Self::handle_data);
        handlers.set(DispatchKey::Exact(MsgType::Close), Self::handle_close);
        handlers.set(DispatchKey::Exact(MsgType::Noop), Self::handle_noop);
        Self { handlers, options: FbdpOptions::default(), events }
    }

    fn handle_open(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        {
            let session = sessions
                .get_mut(rid)
                .ok_or_else(|| Error::channel("no session for OPEN message"))?;
            if session.pipe.is_some() {
                // Client already attached to the data pipe
                return Err(Error::stop(
                    ErrorCode::ProtocolViolation.as_u16(),
                    "out of band OPEN message",
                ));
            }
            let FbdpPayload::Open(open) = &msg.payload else {
                return Err(Error::invalid("OPEN message without dataframe"));
            };
            session.pipe = Some(open.data_pipe.clone());
            session.socket = PipeSocket::from_wire(open.pipe_socket);
            session.data_format = Some(open.data_format.clone());
            session.params.extend(
                open.parameters.iter().map(|(k, v)| (k.clone(), v.clone())),
            );
            proto.events.on_accept_client(channel, session)?;
        }
        proto.init_new_batch(channel, sessions, rid)?;
        Ok(None)
    }

    fn handle_ready(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for READY message"))?;
        if !session.await_ready {
            // Transmission in progress, READY is out of band
            return Err(Error::stop(
                ErrorCode::ProtocolViolation.as_u16(),
                "out of band READY message",
            ));
        }
        session.await_ready = false;
        if msg.type_data == 0 {
            // Client either confirmed our zero, or is not ready yet.
            proto.events.on_schedule_ready(channel, session)?;
        } else {
            // All green to transmit DATA
            session.transmit = Some(msg.type_data);
            if session.socket == Some(PipeSocket::Output) {
                // Initiate transfer to output (via the I/O loop)
                set_session_wait_out(channel, session, true);
            }
        }
        Ok(None)
    }

    fn handle_data(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_data(proto, channel, sessions, rid, msg)
    }

    fn handle_close(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_close(proto, channel, sessions, rid, msg)
    }

    fn handle_noop(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_noop(proto, channel, sessions, rid, msg)
    }

    /// Send another READY to the client.
    ///
    /// When the session is gone, a transmission already runs, or a
    /// READY is already outstanding, the request is ignored with a
    /// diagnostic warning.
    pub fn resend_ready(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
    ) {
        let ok = match sessions.get(rid) {
            None => {
                tracing::warn!(channel = channel.name(), "resend_ready: session cancelled");
                false
            }
            Some(session) if session.transmit.is_some() => {
                tracing::warn!(
                    channel = channel.name(),
                    "resend_ready: transmission already started"
                );
                false
            }
            Some(session) if session.await_ready => {
                tracing::warn!(channel = channel.name(), "resend_ready: READY was already sent");
                false
            }
            Some(_) => true,
        };
        if ok {
            if let Err(err) = self.init_new_batch(channel, sessions, rid) {
                role_handle_exception(
                    self,
                    channel,
                    sessions,
                    rid,
                    &FbdpMessage::new(MsgType::Ready, 0),
                    &err,
                );
            }
        }
    }

    /// Send CLOSE, invoke the close hook and discard the session.
    pub fn send_close(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        error_code: ErrorCode,
        err: Option<&Error>,
    ) -> Result<()> {
        role_send_close(self, channel, sessions, rid, error_code.as_u16(), err)
    }
}

impl<E: FbdpServerEvents> Protocol for FbdpServer<E> {
    type Session = FbdpSession;
    type Message = FbdpMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn validate(&self, frames: &Zmsg) -> Result<()> {
        validate(frames)
    }

    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
        err: &Error,
    ) {
        role_handle_exception(self, channel, sessions, rid, msg, err);
    }

    fn handle_output_ready(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
    ) -> Result<()> {
        role_output_ready(self, channel, sessions)
    }
}

impl<E: FbdpServerEvents> Role for FbdpServer<E> {
    fn options(&self) -> &FbdpOptions {
        &self.options
    }

    fn flow_in(&self) -> PipeSocket {
        // Clients producing data attach to our INPUT
        PipeSocket::Input
    }

    fn init_new_batch(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
    ) -> Result<()> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for batch negotiation"))?;
        session.transmit = None;
        let batch_size = self.events.on_get_ready(channel, session)?;
        if batch_size == 0 {
            self.events.on_schedule_ready(channel, session)?;
        }
        let ready = if batch_size == -1 {
            self.options.batch_size
        } else {
            u16::try_from(batch_size.max(0)).unwrap_or(u16::MAX)
        };
        send_ready(channel, rid, ready)?;
        session.await_ready = true;
        Ok(())
    }

    fn ev_produce_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()> {
        self.events.on_produce_data(channel, session, msg)
    }

    fn ev_accept_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()> {
        self.events.on_accept_data(channel, session, data)
    }

    fn ev_get_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<Option<bool>> {
        self.events.on_get_data(channel, session)
    }

    fn ev_data_confirmed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        type_data: u16,
    ) -> Result<()> {
        self.events.on_data_confirmed(channel, session, type_data)
    }

    fn ev_noop(&mut self, channel: &mut ChannelCore, session: &mut FbdpSession) -> Result<()> {
        self.events.on_noop(channel, session)
    }

    fn ev_pipe_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        self.events.on_pipe_closed(channel, session, msg, err);
    }

    fn ev_exception(&mut self, channel: &mut ChannelCore, msg: &FbdpMessage, err: &Error) {
        self.events.on_exception(channel, msg, err);
    }
}

/// FBDP client side: connects to the pipe endpoint and opens the pipe.
pub struct FbdpClient<E: FbdpClientEvents> {
    handlers: HandlerMap<Self>,
    /// Transmission options.
    pub options: FbdpOptions,
    /// Attached service logic.
    pub events: E,
}

impl<E: FbdpClientEvents> FbdpClient<E> {
    /// Client protocol driving `events`.
    pub fn new(events: E) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Exact(MsgType::Open), Self::handle_open);
        handlers.set(DispatchKey::Exact(MsgType::Ready), Self::handle_ready);
        handlers.set(DispatchKey::Exact(MsgType::Data), Self::handle_data);
        handlers.set(DispatchKey::Exact(MsgType::Close), Self::handle_close);
        handlers.set(DispatchKey::Exact(MsgType::Noop), Self::handle_noop);
        Self { handlers, options: FbdpOptions::default(), events }
    }

    fn handle_open(
        _proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbdpSession>,
        _rid: &RoutingId,
        _msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        Err(Error::stop(
            ErrorCode::ProtocolViolation.as_u16(),
            "OPEN message received from server",
        ))
    }

    fn handle_ready(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for READY message"))?;
        if session.transmit.is_some() {
            // Transmission in progress, READY is out of band
            return Err(Error::stop(
                ErrorCode::ProtocolViolation.as_u16(),
                "out of band READY message",
            ));
        }
        if msg.type_data > 0 {
            // Server is ready
            let negotiated = proto.events.on_server_ready(channel, session, msg.type_data)?;
            let own = if negotiated == -1 {
                proto.options.batch_size
            } else {
                u16::try_from(negotiated.max(0)).unwrap_or(u16::MAX)
            };
            let result = msg.type_data.min(own);
            send_ready(channel, rid, result)?;
            if result > 0 {
                // We are ready to transmit as well
                session.transmit = Some(result);
                if session.socket == Some(PipeSocket::Input) {
                    // Initiate transfer to server (via the I/O loop)
                    set_session_wait_out(channel, session, true);
                }
            }
        } else {
            // Server is not ready, but we must confirm we've got it
            send_ready(channel, rid, 0)?;
        }
        Ok(None)
    }

    fn handle_data(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_data(proto, channel, sessions, rid, msg)
    }

    fn handle_close(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_close(proto, channel, sessions, rid, msg)
    }

    fn handle_noop(
        proto: &mut Self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
    ) -> Result<Option<FbdpMessage>> {
        role_handle_noop(proto, channel, sessions, rid, msg)
    }

    /// Open the data pipe: send OPEN and fill the session.
    ///
    /// # Errors
    ///
    /// Returns a stop error when the OPEN message cannot be sent.
    #[allow(clippy::too_many_arguments)]
    pub fn send_open(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        data_pipe: &str,
        pipe_socket: PipeSocket,
        data_format: &str,
        parameters: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let mut msg = FbdpMessage::new(MsgType::Open, 0);
        msg.payload = FbdpPayload::Open(OpenDataframe {
            data_pipe: data_pipe.to_string(),
            pipe_socket: pipe_socket as u8,
            data_format: data_format.to_string(),
            parameters: parameters.clone().unwrap_or_default(),
        });
        channel.send_frames(&msg.to_frames(), rid).map_err(|_| {
            Error::stop(ErrorCode::Error.as_u16(), "broken pipe, can't send OPEN message")
        })?;
        let session = sessions
            .get_mut(rid)
            .ok_or_else(|| Error::channel("no session for OPEN message"))?;
        session.pipe = Some(data_pipe.to_string());
        session.socket = Some(pipe_socket);
        session.data_format = Some(data_format.to_string());
        if let Some(params) = parameters {
            session.params.extend(params);
        }
        self.events.on_init_session(channel, session);
        Ok(())
    }

    /// Send CLOSE, invoke the close hook and discard the session.
    pub fn send_close(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        error_code: ErrorCode,
        err: Option<&Error>,
    ) -> Result<()> {
        role_send_close(self, channel, sessions, rid, error_code.as_u16(), err)
    }
}

impl<E: FbdpClientEvents> Protocol for FbdpClient<E> {
    type Session = FbdpSession;
    type Message = FbdpMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }

    fn validate(&self, frames: &Zmsg) -> Result<()> {
        validate(frames)
    }

    fn accept_new_session(
        &mut self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<FbdpSession>,
        _rid: &RoutingId,
        _msg: &FbdpMessage,
    ) -> bool {
        // Transmission must be initiated by the client
        false
    }

    fn connect_with_session(&self, _channel: &ChannelCore) -> bool {
        // Connecting peers must send OPEN to initiate transmission
        true
    }

    fn handle_exception(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
        msg: &FbdpMessage,
        err: &Error,
    ) {
        role_handle_exception(self, channel, sessions, rid, msg, err);
    }

    fn handle_output_ready(
        &mut self,
        channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
    ) -> Result<()> {
        role_output_ready(self, channel, sessions)
    }
}

impl<E: FbdpClientEvents> Role for FbdpClient<E> {
    fn options(&self) -> &FbdpOptions {
        &self.options
    }

    fn flow_in(&self) -> PipeSocket {
        // We consume when attached to the server's OUTPUT
        PipeSocket::Output
    }

    fn init_new_batch(
        &mut self,
        _channel: &mut ChannelCore,
        sessions: &mut SessionStore<FbdpSession>,
        rid: &RoutingId,
    ) -> Result<()> {
        if let Some(session) = sessions.get_mut(rid) {
            session.transmit = None;
        }
        Ok(())
    }

    fn ev_produce_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()> {
        self.events.on_produce_data(channel, session, msg)
    }

    fn ev_accept_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()> {
        self.events.on_accept_data(channel, session, data)
    }

    fn ev_get_data(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<Option<bool>> {
        self.events.on_get_data(channel, session)
    }

    fn ev_data_confirmed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        type_data: u16,
    ) -> Result<()> {
        self.events.on_data_confirmed(channel, session, type_data)
    }

    fn ev_noop(&mut self, channel: &mut ChannelCore, session: &mut FbdpSession) -> Result<()> {
        self.events.on_noop(channel, session)
    }

    fn ev_pipe_closed(
        &mut self,
        channel: &mut ChannelCore,
        session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        self.events.on_pipe_closed(channel, session, msg, err);
    }

    fn ev_exception(&mut self, channel: &mut ChannelCore, msg: &FbdpMessage, err: &Error) {
        self.events.on_exception(channel, msg, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_of(msg: &FbdpMessage) -> [u8; HEADER_LEN] {
        msg.header()
    }

    #[test]
    fn test_header_roundtrip() {
        let mut msg = FbdpMessage::new(MsgType::Data, 0x0102);
        msg.flags.set(MsgFlags::ACK_REQ);
        let frames = msg.to_frames();
        let decoded = FbdpMessage::from_frames(&frames).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Data);
        assert_eq!(decoded.type_data, 0x0102);
        assert!(decoded.has_ack_req());
        assert_eq!(header_of(&decoded), header_of(&msg));
    }

    #[test]
    fn test_header_layout() {
        let msg = FbdpMessage::new(MsgType::Ready, 2);
        let header = msg.header();
        assert_eq!(&header[..4], b"FBDP");
        assert_eq!(header[4], (2 << 3) | REVISION);
        assert_eq!(header[5], 0);
        assert_eq!(u16::from_be_bytes([header[6], header[7]]), 2);
    }

    #[test]
    fn test_validate_rejects_bad_frames() {
        assert!(validate(&vec![]).is_err());
        assert!(validate(&vec![Bytes::from_static(b"short")]).is_err());

        let mut bad_fourcc = FbdpMessage::new(MsgType::Noop, 0).to_frames();
        let mut raw = bad_fourcc[0].to_vec();
        raw[0] = b'X';
        bad_fourcc[0] = Bytes::from(raw);
        assert!(validate(&bad_fourcc).is_err());

        let mut bad_version = FbdpMessage::new(MsgType::Noop, 0).to_frames();
        let mut raw = bad_version[0].to_vec();
        raw[4] = (3 << 3) | 5;
        bad_version[0] = Bytes::from(raw);
        assert!(validate(&bad_version).is_err());

        let mut bad_flags = FbdpMessage::new(MsgType::Noop, 0).to_frames();
        let mut raw = bad_flags[0].to_vec();
        raw[5] = 0x10;
        bad_flags[0] = Bytes::from(raw);
        assert!(validate(&bad_flags).is_err());

        let mut bad_type = FbdpMessage::new(MsgType::Noop, 0).to_frames();
        let mut raw = bad_type[0].to_vec();
        raw[4] = (9 << 3) | REVISION;
        bad_type[0] = Bytes::from(raw);
        assert!(validate(&bad_type).is_err());
    }

    #[test]
    fn test_validate_open_requirements() {
        // OPEN without dataframe
        let open = FbdpMessage::new(MsgType::Open, 0);
        let frames = vec![Bytes::copy_from_slice(&open.header())];
        assert!(validate(&frames).is_err());

        // empty pipe name
        let mut msg = FbdpMessage::new(MsgType::Open, 0);
        msg.payload = FbdpPayload::Open(OpenDataframe {
            data_pipe: String::new(),
            pipe_socket: 1,
            data_format: "text/plain".to_string(),
            parameters: HashMap::new(),
        });
        assert!(validate(&msg.to_frames()).is_err());

        // invalid socket
        let mut msg = FbdpMessage::new(MsgType::Open, 0);
        msg.payload = FbdpPayload::Open(OpenDataframe {
            data_pipe: "p".to_string(),
            pipe_socket: 0,
            data_format: "text/plain".to_string(),
            parameters: HashMap::new(),
        });
        assert!(validate(&msg.to_frames()).is_err());

        // missing format
        let mut msg = FbdpMessage::new(MsgType::Open, 0);
        msg.payload = FbdpPayload::Open(OpenDataframe {
            data_pipe: "p".to_string(),
            pipe_socket: 1,
            data_format: String::new(),
            parameters: HashMap::new(),
        });
        assert!(validate(&msg.to_frames()).is_err());

        // a good one
        let mut msg = FbdpMessage::new(MsgType::Open, 0);
        msg.payload = FbdpPayload::Open(OpenDataframe {
            data_pipe: "p".to_string(),
            pipe_socket: 2,
            data_format: "text/plain".to_string(),
            parameters: HashMap::new(),
        });
        assert!(validate(&msg.to_frames()).is_ok());
    }

    #[test]
    fn test_validate_frame_counts() {
        let mut data = FbdpMessage::data(Some(Bytes::from_static(b"payload"))).to_frames();
        data.push(Bytes::from_static(b"extra"));
        assert!(validate(&data).is_err());

        let mut ready = FbdpMessage::new(MsgType::Ready, 1).to_frames();
        ready.push(Bytes::from_static(b"extra"));
        assert!(validate(&ready).is_err());

        let mut noop = FbdpMessage::new(MsgType::Noop, 0).to_frames();
        noop.push(Bytes::from_static(b"extra"));
        assert!(validate(&noop).is_err());
    }

    #[test]
    fn test_close_error_descriptions_roundtrip() {
        let mut msg = FbdpMessage::close(ErrorCode::Error.as_u16());
        msg.note_error(&Error::stop(ErrorCode::Error.as_u16(), "pipe trouble"));
        let frames = msg.to_frames();
        let decoded = FbdpMessage::from_frames(&frames).unwrap();
        assert_eq!(decoded.errors().len(), 1);
        assert_eq!(decoded.errors()[0].description, "pipe trouble");
        assert_eq!(
            ErrorCode::from_wire(decoded.type_data),
            Some(ErrorCode::Error)
        );
    }

    #[test]
    fn test_ack_reply_builder() {
        let mut data = FbdpMessage::data(Some(Bytes::from_static(b"x")));
        data.type_data = 7;
        data.flags.set(MsgFlags::ACK_REQ);
        let reply = FbdpMessage::ack_reply_for(&data);
        assert_eq!(reply.msg_type, MsgType::Data);
        assert_eq!(reply.type_data, 7);
        assert!(!reply.has_ack_req());
        assert!(reply.has_ack_reply());
        assert!(reply.data_frame().is_none());
    }
}
