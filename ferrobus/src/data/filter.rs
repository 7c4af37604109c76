//! Data filter microservice base.
//!
//! A filter reads data from an input pipe, processes it, and writes
//! the results to an output pipe. It manages two FBDP connections plus
//! an internal inproc PUSH/PULL *wake* channel pair: processed data
//! lands in an output buffer and a wake ping re-arms the output
//! transmission from within the I/O loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use ferrobus_core::channel::{Channel, ChannelConfig, ChannelCore};
use ferrobus_core::endpoint::ZmqAddress;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::message::SimpleMessage;
use ferrobus_core::protocol::{DispatchKey, HandlerMap, Protocol};
use ferrobus_core::session::{Session, SessionBase, SessionStore};
use ferrobus_core::types::{Direction, PipeSocket, RoutingId, SocketKind, SocketMode};
use ferrobus_proto::fbdp::{
    ErrorCode, FbdpClient, FbdpClientEvents, FbdpEvents, FbdpMessage, FbdpServer,
    FbdpServerEvents, FbdpSession,
};

use crate::config::{self, ConfigTable};
use crate::data::onepipe::PipeConfig;
use crate::micro::{ExecutionState, Runtime, ServiceImpl, StopToken};
use crate::scheduler::SchedulerHandle;

/// Input pipe channel & endpoint name.
pub const INPUT_PIPE_CHN: &str = "input-pipe";
/// Output pipe channel & endpoint name.
pub const OUTPUT_PIPE_CHN: &str = "output-pipe";
/// Wake PUSH channel name.
pub const WAKE_PUSH_CHN: &str = "wake-push";
/// Wake PULL channel & endpoint name.
pub const WAKE_PULL_CHN: &str = "wake-pull";

/// Configuration of a data filter: an input pipe, an output pipe, and
/// the error propagation policy between them.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// When the input pipe closes with an error, close the output with
    /// the same error as well.
    pub propagate_input_error: bool,
    /// Input pipe configuration.
    pub input: PipeConfig,
    /// Output pipe configuration.
    pub output: PipeConfig,
}

impl FilterConfig {
    /// Load from a configuration table, rejecting unknown options.
    pub fn load(table: &ConfigTable) -> Result<Self> {
        const OPTIONS: [&str; 13] = [
            "propagate_input_error",
            "input_pipe",
            "input_pipe_address",
            "input_pipe_mode",
            "input_pipe_format",
            "input_batch_size",
            "input_ready_schedule_interval",
            "output_pipe",
            "output_pipe_address",
            "output_pipe_mode",
            "output_pipe_format",
            "output_batch_size",
            "output_ready_schedule_interval",
        ];
        config::ensure_known(table, &OPTIONS)?;
        Ok(Self {
            propagate_input_error: config::get_bool(table, "propagate_input_error", true)?,
            input: PipeConfig::from_table(table, "input_")?,
            output: PipeConfig::from_table(table, "output_")?,
        })
    }

    /// Extended validation: formats are required for connect modes.
    pub fn validate(&self) -> Result<()> {
        if self.input.pipe_mode == SocketMode::Connect && self.input.pipe_format.is_none() {
            return Err(Error::config("'input_pipe_format' required for connect pipe mode"));
        }
        if self.output.pipe_mode == SocketMode::Connect && self.output.pipe_format.is_none() {
            return Err(Error::config("'output_pipe_format' required for connect pipe mode"));
        }
        Ok(())
    }
}

/// User logic of a data filter.
pub trait FilterHandler: 'static {
    /// A client attached to the input pipe; the base already validated
    /// the pipe name and socket.
    fn accept_input_client(&mut self, session: &FbdpSession) -> Result<()> {
        let _ = session;
        Ok(())
    }

    /// A client attached to the output pipe.
    fn accept_output_client(&mut self, session: &FbdpSession) -> Result<()> {
        let _ = session;
        Ok(())
    }

    /// Process one item from the input pipe; push any produced output
    /// items into `produced`.
    fn process_data(&mut self, data: Option<&Bytes>, produced: &mut Vec<Bytes>) -> Result<()>;

    /// The input pipe closed while the output keeps draining. With
    /// [`ErrorCode::Ok`] the input ended normally.
    fn finish_input(&mut self, code: Option<ErrorCode>) {
        let _ = code;
    }
}

/// Either side of an FBDP pipe, server or client.
enum FbdpEnd<E: FbdpServerEvents + FbdpClientEvents> {
    Server(Rc<RefCell<Channel<FbdpServer<E>>>>),
    Client(Rc<RefCell<Channel<FbdpClient<E>>>>),
}

impl<E: FbdpServerEvents + FbdpClientEvents> Clone for FbdpEnd<E> {
    fn clone(&self) -> Self {
        match self {
            FbdpEnd::Server(channel) => FbdpEnd::Server(channel.clone()),
            FbdpEnd::Client(channel) => FbdpEnd::Client(channel.clone()),
        }
    }
}

impl<E: FbdpServerEvents + FbdpClientEvents> FbdpEnd<E> {
    fn has_sessions(&self) -> bool {
        match self {
            FbdpEnd::Server(channel) => !channel.borrow().sessions().is_empty(),
            FbdpEnd::Client(channel) => !channel.borrow().sessions().is_empty(),
        }
    }

    /// Send CLOSE on every active session of this pipe end.
    fn close_all(&self, code: ErrorCode, err: Option<&Error>) {
        match self {
            FbdpEnd::Server(channel) => {
                let mut channel = channel.borrow_mut();
                let (core, protocol, sessions) = channel.parts();
                for rid in sessions.routing_ids() {
                    if let Err(close_err) = protocol.send_close(core, sessions, &rid, code, err) {
                        tracing::debug!(error = %close_err, "pipe close failed");
                    }
                }
            }
            FbdpEnd::Client(channel) => {
                let mut channel = channel.borrow_mut();
                let (core, protocol, sessions) = channel.parts();
                for rid in sessions.routing_ids() {
                    if let Err(close_err) = protocol.send_close(core, sessions, &rid, code, err) {
                        tracing::debug!(error = %close_err, "pipe close failed");
                    }
                }
            }
        }
    }

    /// Data became available: re-arm the transmission. Inside a
    /// running batch this resumes the output pump; a server without an
    /// outstanding READY starts a new batch immediately.
    fn wake(&self) {
        match self {
            FbdpEnd::Server(channel) => {
                let mut channel = channel.borrow_mut();
                let (core, protocol, sessions) = channel.parts();
                let Some(state) = sessions
                    .single()
                    .map(|s| (s.routing_id().clone(), s.transmit.is_some(), s.await_ready))
                else {
                    return;
                };
                let (rid, transmitting, await_ready) = state;
                if transmitting {
                    core.set_wait_out(true);
                    if let Some(session) = sessions.get_mut(&rid) {
                        session.set_send_pending(true);
                    }
                } else if !await_ready {
                    protocol.resend_ready(core, sessions, &rid);
                }
            }
            FbdpEnd::Client(channel) => {
                let mut channel = channel.borrow_mut();
                let (core, _protocol, sessions) = channel.parts();
                let Some(rid) = sessions
                    .single()
                    .filter(|s| s.transmit.is_some())
                    .map(|s| s.routing_id().clone())
                else {
                    return;
                };
                core.set_wait_out(true);
                if let Some(session) = sessions.get_mut(&rid) {
                    session.set_send_pending(true);
                }
            }
        }
    }
}

type EndSlot<E> = Rc<RefCell<Option<FbdpEnd<E>>>>;
type WakeChannel<H> = Rc<RefCell<Channel<WakeProtocol<H>>>>;

/// State shared between the filter's event adapters.
struct FilterShared<H: FilterHandler> {
    handler: Rc<RefCell<H>>,
    output: Rc<RefCell<VecDeque<Bytes>>>,
    closing: Rc<Cell<bool>>,
    propagate_input_error: bool,
    stop: StopToken,
    exec: Rc<RefCell<ExecutionState>>,
    scheduler: SchedulerHandle,
    wake: Rc<RefCell<Option<WakeChannel<H>>>>,
}

impl<H: FilterHandler> Clone for FilterShared<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            output: self.output.clone(),
            closing: self.closing.clone(),
            propagate_input_error: self.propagate_input_error,
            stop: self.stop.clone(),
            exec: self.exec.clone(),
            scheduler: self.scheduler.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<H: FilterHandler> FilterShared<H> {
    /// Send a wake ping to the PULL side of the wake pair.
    fn send_wake(&self) {
        if let Some(wake) = self.wake.borrow().as_ref() {
            let ping = SimpleMessage::from_frame(Bytes::from_static(b"wake"));
            if let Err(err) = wake.borrow_mut().send(&ping, &RoutingId::internal()) {
                tracing::warn!(error = %err, "wake ping failed");
            }
        }
    }

    fn note_pipe_error(&self, code: Option<ErrorCode>, err: Option<&Error>) {
        if let (Some(err), true) = (err, code != Some(ErrorCode::Ok)) {
            self.exec.borrow_mut().note_error(err);
        }
    }

    fn note_exception(&self, err: &Error) {
        if err.stop_code() == Some(ErrorCode::Ok.as_u16()) {
            return;
        }
        self.exec.borrow_mut().note_error(err);
    }
}

/// FBDP event adapter for the filter's input pipe (the consuming
/// side).
pub struct FilterInputEvents<H: FilterHandler> {
    shared: FilterShared<H>,
    pipe: String,
    ready_schedule_interval: u64,
    server_channel: Option<Weak<RefCell<Channel<FbdpServer<FilterInputEvents<H>>>>>>,
    out_end: EndSlot<FilterOutputEvents<H>>,
}

impl<H: FilterHandler> FbdpEvents for FilterInputEvents<H> {
    fn on_accept_data(
        &mut self,
        _channel: &mut ChannelCore,
        _session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()> {
        let mut produced = Vec::new();
        self.shared.handler.borrow_mut().process_data(data, &mut produced)?;
        if !produced.is_empty() {
            self.shared.output.borrow_mut().extend(produced);
            self.shared.send_wake();
        }
        Ok(())
    }

    fn on_pipe_closed(
        &mut self,
        _channel: &mut ChannelCore,
        _session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        let code = ErrorCode::from_wire(msg.type_data);
        self.shared.note_pipe_error(code, err);
        self.shared.handler.borrow_mut().finish_input(code);
        // Close the output as well when the input failed and errors
        // propagate, or when there is nothing left to drain.
        let input_failed = code != Some(ErrorCode::Ok);
        let drained = self.shared.output.borrow().is_empty();
        if (input_failed && self.shared.propagate_input_error) || drained {
            if !self.shared.closing.get() {
                self.shared.closing.set(true);
                if let Some(out_end) = self.out_end.borrow().as_ref() {
                    out_end.close_all(code.unwrap_or(ErrorCode::Error), err);
                }
            }
            self.shared.stop.set();
        }
        self.shared.closing.set(false);
    }

    fn on_exception(&mut self, _channel: &mut ChannelCore, _msg: &FbdpMessage, err: &Error) {
        self.shared.note_exception(err);
    }
}

impl<H: FilterHandler> FbdpServerEvents for FilterInputEvents<H> {
    fn on_accept_client(
        &mut self,
        _channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        if session.pipe.as_deref() != Some(self.pipe.as_str()) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                format!("unknown data pipe '{}'", session.pipe.as_deref().unwrap_or("")),
            ));
        }
        // Clients can attach only to our INPUT
        if session.socket != Some(PipeSocket::Input) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                "only the INPUT socket is available",
            ));
        }
        self.shared.handler.borrow_mut().accept_input_client(session)
    }

    fn on_schedule_ready(
        &mut self,
        _channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        schedule_resend(
            &self.shared.scheduler,
            self.ready_schedule_interval,
            self.server_channel.clone(),
            session.routing_id().clone(),
        )
    }
}

impl<H: FilterHandler> FbdpClientEvents for FilterInputEvents<H> {}

/// FBDP event adapter for the filter's output pipe (the producing
/// side).
pub struct FilterOutputEvents<H: FilterHandler> {
    shared: FilterShared<H>,
    pipe: String,
    ready_schedule_interval: u64,
    server_channel: Option<Weak<RefCell<Channel<FbdpServer<FilterOutputEvents<H>>>>>>,
    in_end: EndSlot<FilterInputEvents<H>>,
}

impl<H: FilterHandler> FilterOutputEvents<H> {
    fn input_open(&self) -> bool {
        self.in_end
            .borrow()
            .as_ref()
            .map(FbdpEnd::has_sessions)
            .unwrap_or(false)
    }
}

impl<H: FilterHandler> FbdpEvents for FilterOutputEvents<H> {
    fn on_produce_data(
        &mut self,
        _channel: &mut ChannelCore,
        _session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()> {
        match self.shared.output.borrow_mut().pop_front() {
            Some(data) => {
                *msg = FbdpMessage::data(Some(data));
                Ok(())
            }
            None if !self.input_open() => Err(Error::stop(ErrorCode::Ok.as_u16(), "EOF")),
            None => Err(Error::stop(
                ErrorCode::InternalError.as_u16(),
                "output buffer empty",
            )),
        }
    }

    fn on_get_data(
        &mut self,
        _channel: &mut ChannelCore,
        _session: &mut FbdpSession,
    ) -> Result<Option<bool>> {
        let have_data = !self.shared.output.borrow().is_empty();
        if !have_data && !self.input_open() {
            return Err(Error::stop(ErrorCode::Ok.as_u16(), "EOF"));
        }
        Ok(Some(have_data))
    }

    fn on_pipe_closed(
        &mut self,
        _channel: &mut ChannelCore,
        _session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        let code = ErrorCode::from_wire(msg.type_data);
        self.shared.note_pipe_error(code, err);
        // Close the input pipe if it's still open
        if !self.shared.closing.get() {
            self.shared.closing.set(true);
            if let Some(in_end) = self.in_end.borrow().as_ref() {
                in_end.close_all(code.unwrap_or(ErrorCode::Error), err);
            }
        }
        self.shared.stop.set();
        self.shared.closing.set(false);
    }

    fn on_exception(&mut self, _channel: &mut ChannelCore, _msg: &FbdpMessage, err: &Error) {
        self.shared.note_exception(err);
    }
}

impl<H: FilterHandler> FbdpServerEvents for FilterOutputEvents<H> {
    fn on_accept_client(
        &mut self,
        _channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        if session.pipe.as_deref() != Some(self.pipe.as_str()) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                format!("unknown data pipe '{}'", session.pipe.as_deref().unwrap_or("")),
            ));
        }
        // Clients can attach only to our OUTPUT
        if session.socket != Some(PipeSocket::Output) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                "only the OUTPUT socket is available",
            ));
        }
        self.shared.handler.borrow_mut().accept_output_client(session)
    }

    fn on_schedule_ready(
        &mut self,
        _channel: &mut ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        schedule_resend(
            &self.shared.scheduler,
            self.ready_schedule_interval,
            self.server_channel.clone(),
            session.routing_id().clone(),
        )
    }
}

impl<H: FilterHandler> FbdpClientEvents for FilterOutputEvents<H> {}

fn schedule_resend<E: FbdpServerEvents>(
    scheduler: &SchedulerHandle,
    interval_ms: u64,
    channel: Option<Weak<RefCell<Channel<FbdpServer<E>>>>>,
    rid: RoutingId,
) -> Result<()> {
    let Some(weak) = channel else {
        return Err(Error::stop(
            ErrorCode::InternalError.as_u16(),
            "READY scheduler not wired",
        ));
    };
    scheduler.schedule(interval_ms, move || {
        if let Some(channel) = weak.upgrade() {
            let mut channel = channel.borrow_mut();
            let (core, protocol, sessions) = channel.parts();
            protocol.resend_ready(core, sessions, &rid);
        }
    });
    Ok(())
}

/// Protocol of the internal wake channel pair.
///
/// Wake pings carry no information; receiving one re-arms the output
/// pipe transmission when buffered data is waiting.
pub struct WakeProtocol<H: FilterHandler> {
    handlers: HandlerMap<Self>,
    output: Rc<RefCell<VecDeque<Bytes>>>,
    out_end: EndSlot<FilterOutputEvents<H>>,
}

impl<H: FilterHandler> WakeProtocol<H> {
    fn new(output: Rc<RefCell<VecDeque<Bytes>>>, out_end: EndSlot<FilterOutputEvents<H>>) -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Any, Self::handle_wake as _);
        Self { handlers, output, out_end }
    }

    fn handle_wake(
        proto: &mut Self,
        _channel: &mut ChannelCore,
        _sessions: &mut SessionStore<SessionBase>,
        _rid: &RoutingId,
        _msg: &SimpleMessage,
    ) -> Result<Option<SimpleMessage>> {
        if proto.output.borrow().is_empty() {
            // All data were already sent before the ping arrived
            return Ok(None);
        }
        if let Some(out_end) = proto.out_end.borrow().as_ref() {
            out_end.wake();
        }
        Ok(None)
    }
}

impl<H: FilterHandler> Protocol for WakeProtocol<H> {
    type Session = SessionBase;
    type Message = SimpleMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }
}

/// Data filter microservice base, hosted in a
/// [`MicroService`](crate::micro::MicroService).
pub struct DataFilterService<H: FilterHandler> {
    config: FilterConfig,
    handler: Option<H>,
    in_end: EndSlot<FilterInputEvents<H>>,
    out_end: EndSlot<FilterOutputEvents<H>>,
    wake_push: Option<WakeChannel<H>>,
    wake_address: Option<ZmqAddress>,
}

impl<H: FilterHandler> DataFilterService<H> {
    /// Filter base over `config` driving `handler`.
    pub fn new(config: FilterConfig, handler: H) -> Self {
        Self {
            config,
            handler: Some(handler),
            in_end: Rc::new(RefCell::new(None)),
            out_end: Rc::new(RefCell::new(None)),
            wake_push: None,
            wake_address: None,
        }
    }

    /// The filter configuration.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

impl<H: FilterHandler> ServiceImpl for DataFilterService<H> {
    fn register(&mut self, rt: &mut Runtime) -> Result<()> {
        self.config.validate()?;
        let handler = self
            .handler
            .take()
            .ok_or_else(|| Error::service("data filter service already registered"))?;
        let shared = FilterShared {
            handler: Rc::new(RefCell::new(handler)),
            output: Rc::new(RefCell::new(VecDeque::new())),
            closing: Rc::new(Cell::new(false)),
            propagate_input_error: self.config.propagate_input_error,
            stop: rt.stop.clone(),
            exec: rt.execution(),
            scheduler: rt.scheduler.clone(),
            wake: Rc::new(RefCell::new(None)),
        };
        // INPUT pipe
        let input_events = FilterInputEvents {
            shared: shared.clone(),
            pipe: self.config.input.pipe.clone(),
            ready_schedule_interval: self.config.input.ready_schedule_interval,
            server_channel: None,
            out_end: self.out_end.clone(),
        };
        let input_cfg = ChannelConfig::wait_for(Direction::IN);
        match self.config.input.pipe_mode {
            SocketMode::Bind => {
                let mut protocol = FbdpServer::new(input_events);
                protocol.options.batch_size = self.config.input.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    INPUT_PIPE_CHN,
                    protocol,
                    input_cfg,
                )?;
                channel.borrow_mut().protocol_mut().events.server_channel =
                    Some(Rc::downgrade(&channel));
                rt.endpoints.insert(
                    INPUT_PIPE_CHN.to_string(),
                    vec![self.config.input.pipe_address.clone()],
                );
                *self.in_end.borrow_mut() = Some(FbdpEnd::Server(channel));
            }
            SocketMode::Connect => {
                let mut protocol = FbdpClient::new(input_events);
                protocol.options.batch_size = self.config.input.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    INPUT_PIPE_CHN,
                    protocol,
                    input_cfg,
                )?;
                *self.in_end.borrow_mut() = Some(FbdpEnd::Client(channel));
            }
            SocketMode::Unknown => return Err(Error::config("input pipe mode not configured")),
        }
        // OUTPUT pipe
        let output_events = FilterOutputEvents {
            shared: shared.clone(),
            pipe: self.config.output.pipe.clone(),
            ready_schedule_interval: self.config.output.ready_schedule_interval,
            server_channel: None,
            in_end: self.in_end.clone(),
        };
        let output_cfg = ChannelConfig::wait_for(Direction::IN);
        match self.config.output.pipe_mode {
            SocketMode::Bind => {
                let mut protocol = FbdpServer::new(output_events);
                protocol.options.batch_size = self.config.output.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    OUTPUT_PIPE_CHN,
                    protocol,
                    output_cfg,
                )?;
                channel.borrow_mut().protocol_mut().events.server_channel =
                    Some(Rc::downgrade(&channel));
                rt.endpoints.insert(
                    OUTPUT_PIPE_CHN.to_string(),
                    vec![self.config.output.pipe_address.clone()],
                );
                *self.out_end.borrow_mut() = Some(FbdpEnd::Server(channel));
            }
            SocketMode::Connect => {
                let mut protocol = FbdpClient::new(output_events);
                protocol.options.batch_size = self.config.output.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    OUTPUT_PIPE_CHN,
                    protocol,
                    output_cfg,
                )?;
                *self.out_end.borrow_mut() = Some(FbdpEnd::Client(channel));
            }
            SocketMode::Unknown => return Err(Error::config("output pipe mode not configured")),
        }
        // Wake channels
        let wake_address: ZmqAddress = format!("inproc://{}-wake", rt.peer.uid.simple())
            .parse()
            .map_err(|err| Error::channel(format!("wake address: {err}")))?;
        let wake_pull = WakeProtocol::new(shared.output.clone(), self.out_end.clone());
        rt.mngr.create_channel(
            SocketKind::Pull,
            WAKE_PULL_CHN,
            wake_pull,
            ChannelConfig::wait_for(Direction::IN),
        )?;
        let wake_push_proto = WakeProtocol::new(shared.output.clone(), self.out_end.clone());
        let wake_push = rt.mngr.create_channel(
            SocketKind::Push,
            WAKE_PUSH_CHN,
            wake_push_proto,
            ChannelConfig::default(),
        )?;
        rt.endpoints
            .insert(WAKE_PULL_CHN.to_string(), vec![wake_address.clone()]);
        *shared.wake.borrow_mut() = Some(wake_push.clone());
        self.wake_push = Some(wake_push);
        self.wake_address = Some(wake_address);
        Ok(())
    }

    fn acquire_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        // Connect wake PUSH
        let (Some(wake_push), Some(wake_address)) = (&self.wake_push, &self.wake_address) else {
            return Err(Error::service("filter not registered"));
        };
        wake_push.borrow_mut().connect(wake_address, None)?;
        // Connect to the data pipes; a filter consumes from the
        // server's OUTPUT and produces into the server's INPUT.
        if let Some(FbdpEnd::Client(channel)) = self.in_end.borrow().as_ref() {
            let mut channel = channel.borrow_mut();
            let rid = channel
                .connect(&self.config.input.pipe_address, None)?
                .ok_or_else(|| Error::channel("pipe connect created no session"))?;
            let format = self
                .config
                .input
                .pipe_format
                .clone()
                .ok_or_else(|| Error::config("'input_pipe_format' required"))?;
            let (core, protocol, sessions) = channel.parts();
            protocol.send_open(
                core,
                sessions,
                &rid,
                &self.config.input.pipe,
                PipeSocket::Output,
                &format,
                None,
            )?;
        }
        if let Some(FbdpEnd::Client(channel)) = self.out_end.borrow().as_ref() {
            let mut channel = channel.borrow_mut();
            let rid = channel
                .connect(&self.config.output.pipe_address, None)?
                .ok_or_else(|| Error::channel("pipe connect created no session"))?;
            let format = self
                .config
                .output
                .pipe_format
                .clone()
                .ok_or_else(|| Error::config("'output_pipe_format' required"))?;
            let (core, protocol, sessions) = channel.parts();
            protocol.send_open(
                core,
                sessions,
                &rid,
                &self.config.output.pipe,
                PipeSocket::Input,
                &format,
                None,
            )?;
        }
        Ok(())
    }

    fn release_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        // Disconnect wake PUSH
        if let Some(wake_push) = &self.wake_push {
            let mut channel = wake_push.borrow_mut();
            for rid in channel.sessions().routing_ids() {
                channel.discard_session(&rid);
            }
        }
        // CLOSE all active pipe sessions; a shutdown with open pipes
        // is abnormal, so the peers get an error code.
        if let Some(in_end) = self.in_end.borrow().as_ref() {
            in_end.close_all(ErrorCode::Error, None);
        }
        if let Some(out_end) = self.out_end.borrow().as_ref() {
            out_end.close_all(ErrorCode::Error, None);
        }
        Ok(())
    }
}
