//! Data provider/consumer microservice bases.
//!
//! Reusable FBDP wiring for services that move data over a single
//! pipe: a *provider* produces DATA messages, a *consumer* accepts
//! them. Either base can act as the FBDP server (bind) or client
//! (connect), selected by the pipe mode. User logic plugs in through
//! [`PipeHandler`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use ferrobus_core::channel::{Channel, ChannelConfig};
use ferrobus_core::endpoint::ZmqAddress;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::session::Session;
use ferrobus_core::types::{Direction, PipeSocket, SocketKind, SocketMode};
use ferrobus_proto::fbdp::{
    ErrorCode, FbdpClient, FbdpClientEvents, FbdpEvents, FbdpMessage, FbdpServer,
    FbdpServerEvents, FbdpSession, DATA_BATCH_SIZE,
};

use crate::config::{self, ConfigTable};
use crate::micro::{ExecutionState, Runtime, ServiceImpl, StopToken};
use crate::scheduler::SchedulerHandle;

/// Pipe channel & endpoint name.
pub const PIPE_CHN: &str = "pipe";

/// Default READY reschedule interval in milliseconds.
pub const READY_SCHEDULE_INTERVAL_MS: u64 = 1000;

/// Configuration of one data pipe.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Stop the service when the pipe is closed.
    pub stop_on_close: bool,
    /// Data pipe identification.
    pub pipe: String,
    /// Data pipe endpoint address.
    pub pipe_address: ZmqAddress,
    /// Data pipe mode (bind or connect).
    pub pipe_mode: SocketMode,
    /// Pipe data format specification (MIME); required for connect
    /// mode.
    pub pipe_format: Option<String>,
    /// Data batch size.
    pub batch_size: u16,
    /// READY message reschedule interval in milliseconds.
    pub ready_schedule_interval: u64,
}

impl PipeConfig {
    /// Option names understood by [`load`](Self::load).
    pub const OPTIONS: [&'static str; 7] = [
        "stop_on_close",
        "pipe",
        "pipe_address",
        "pipe_mode",
        "pipe_format",
        "batch_size",
        "ready_schedule_interval",
    ];

    /// Load from a configuration table, rejecting unknown options.
    pub fn load(table: &ConfigTable) -> Result<Self> {
        config::ensure_known(table, &Self::OPTIONS)?;
        Self::from_table(table, "")
    }

    /// Load from a table with every option name prefixed (used by the
    /// filter base for its `input_`/`output_` pipe pairs). Unknown
    /// options are the caller's concern.
    pub fn from_table(table: &ConfigTable, prefix: &str) -> Result<Self> {
        let key = |name: &str| format!("{prefix}{name}");
        let mode = config::require_str(table, &key("pipe_mode"))?;
        let pipe_mode = match mode.to_ascii_lowercase().as_str() {
            "bind" => SocketMode::Bind,
            "connect" => SocketMode::Connect,
            other => {
                return Err(Error::config(format!(
                    "option '{}': expected 'bind' or 'connect', got '{other}'",
                    key("pipe_mode")
                )))
            }
        };
        let batch_size = config::get_int(table, &key("batch_size"), i64::from(DATA_BATCH_SIZE))?;
        let batch_size = u16::try_from(batch_size)
            .map_err(|_| Error::config(format!("option '{}' out of range", key("batch_size"))))?;
        let interval = config::get_int(
            table,
            &key("ready_schedule_interval"),
            READY_SCHEDULE_INTERVAL_MS as i64,
        )?;
        let ready_schedule_interval = u64::try_from(interval).map_err(|_| {
            Error::config(format!("option '{}' out of range", key("ready_schedule_interval")))
        })?;
        Ok(Self {
            stop_on_close: config::get_bool(table, &key("stop_on_close"), true)?,
            pipe: config::require_str(table, &key("pipe"))?,
            pipe_address: config::require_address(table, &key("pipe_address"))?,
            pipe_mode,
            pipe_format: config::get_str(table, &key("pipe_format"))?,
            batch_size,
            ready_schedule_interval,
        })
    }

    /// Extended validation: `pipe_format` is required for connect
    /// mode.
    pub fn validate(&self) -> Result<()> {
        if self.pipe_mode == SocketMode::Connect && self.pipe_format.is_none() {
            return Err(Error::config("'pipe_format' required for connect pipe mode"));
        }
        Ok(())
    }
}

/// User logic of a data provider or consumer.
pub trait PipeHandler: 'static {
    /// A client attached to the pipe; the base already validated the
    /// pipe name and socket. Reject with a stop error to refuse.
    fn accept_client(&mut self, session: &FbdpSession) -> Result<()> {
        let _ = session;
        Ok(())
    }

    /// PROVIDER: fill the outgoing DATA message. Signal end of data
    /// with a stop carrying [`ErrorCode::Ok`].
    fn produce_data(&mut self, msg: &mut FbdpMessage) -> Result<()> {
        let _ = msg;
        Err(Error::stop(ErrorCode::Ok.as_u16(), "OK"))
    }

    /// CONSUMER: process the payload of a received DATA message.
    fn accept_data(&mut self, data: Option<&Bytes>) -> Result<()> {
        let _ = data;
        Err(Error::stop(ErrorCode::Ok.as_u16(), "OK"))
    }

    /// Data availability: `None` marks a stable source that can always
    /// produce or accept.
    fn get_data(&mut self) -> Option<bool> {
        None
    }

    /// The pipe was closed, with the close code and the causing error
    /// when one applies.
    fn pipe_closed(&mut self, code: Option<ErrorCode>, err: Option<&Error>) {
        let _ = (code, err);
    }
}

/// FBDP event adapter wiring a [`PipeHandler`] into the runtime.
pub struct PipeEndEvents<H: PipeHandler> {
    handler: H,
    pipe: String,
    server_socket: PipeSocket,
    stop_on_close: bool,
    ready_schedule_interval: u64,
    stop: StopToken,
    exec: Rc<RefCell<ExecutionState>>,
    scheduler: SchedulerHandle,
    server_channel: Option<Weak<RefCell<Channel<FbdpServer<PipeEndEvents<H>>>>>>,
}

impl<H: PipeHandler> PipeEndEvents<H> {
    fn new(handler: H, cfg: &PipeConfig, server_socket: PipeSocket, rt: &Runtime) -> Self {
        Self {
            handler,
            pipe: cfg.pipe.clone(),
            server_socket,
            stop_on_close: cfg.stop_on_close,
            ready_schedule_interval: cfg.ready_schedule_interval,
            stop: rt.stop.clone(),
            exec: rt.execution(),
            scheduler: rt.scheduler.clone(),
            server_channel: None,
        }
    }

    /// The wrapped user handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The wrapped user handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: PipeHandler> FbdpEvents for PipeEndEvents<H> {
    fn on_produce_data(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        _session: &mut FbdpSession,
        msg: &mut FbdpMessage,
    ) -> Result<()> {
        self.handler.produce_data(msg)
    }

    fn on_accept_data(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        _session: &mut FbdpSession,
        data: Option<&Bytes>,
    ) -> Result<()> {
        self.handler.accept_data(data)
    }

    fn on_get_data(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        _session: &mut FbdpSession,
    ) -> Result<Option<bool>> {
        Ok(self.handler.get_data())
    }

    fn on_pipe_closed(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        _session: &mut FbdpSession,
        msg: &FbdpMessage,
        err: Option<&Error>,
    ) {
        // The protocol converts handler failures into CLOSE messages,
        // so this is the central place to note pipe errors.
        if let Some(err) = err {
            self.exec.borrow_mut().note_error(err);
        }
        self.handler.pipe_closed(ErrorCode::from_wire(msg.type_data), err);
        if self.stop_on_close {
            self.stop.set();
        }
    }

    fn on_exception(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        _msg: &FbdpMessage,
        err: &Error,
    ) {
        self.exec.borrow_mut().note_error(err);
    }
}

impl<H: PipeHandler> FbdpServerEvents for PipeEndEvents<H> {
    fn on_accept_client(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        if session.pipe.as_deref() != Some(self.pipe.as_str()) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                format!("unknown data pipe '{}'", session.pipe.as_deref().unwrap_or("")),
            ));
        }
        // We are the server, so clients can only attach to our side's socket
        if session.socket != Some(self.server_socket) {
            return Err(Error::stop(
                ErrorCode::PipeEndpointUnavailable.as_u16(),
                format!("'{}' socket not available", self.server_socket.peer()),
            ));
        }
        self.handler.accept_client(session)
    }

    fn on_schedule_ready(
        &mut self,
        _channel: &mut ferrobus_core::channel::ChannelCore,
        session: &mut FbdpSession,
    ) -> Result<()> {
        let Some(weak) = self.server_channel.clone() else {
            return Err(Error::stop(
                ErrorCode::InternalError.as_u16(),
                "READY scheduler not wired",
            ));
        };
        let rid = session.routing_id().clone();
        self.scheduler.schedule(self.ready_schedule_interval, move || {
            if let Some(channel) = weak.upgrade() {
                let mut channel = channel.borrow_mut();
                let (core, protocol, sessions) = channel.parts();
                protocol.resend_ready(core, sessions, &rid);
            }
        });
        Ok(())
    }
}

impl<H: PipeHandler> FbdpClientEvents for PipeEndEvents<H> {}

type ServerChannel<H> = Rc<RefCell<Channel<FbdpServer<PipeEndEvents<H>>>>>;
type ClientChannel<H> = Rc<RefCell<Channel<FbdpClient<PipeEndEvents<H>>>>>;

/// Data provider/consumer microservice base.
///
/// Built through [`provider`](Self::provider) or
/// [`consumer`](Self::consumer) and hosted in a
/// [`MicroService`](crate::micro::MicroService).
pub struct DataPipeService<H: PipeHandler> {
    config: PipeConfig,
    server_socket: PipeSocket,
    handler: Option<H>,
    server: Option<ServerChannel<H>>,
    client: Option<ClientChannel<H>>,
}

impl<H: PipeHandler> DataPipeService<H> {
    /// Base for a data provider: the service side of the pipe is
    /// OUTPUT.
    pub fn provider(config: PipeConfig, handler: H) -> Self {
        Self {
            config,
            server_socket: PipeSocket::Output,
            handler: Some(handler),
            server: None,
            client: None,
        }
    }

    /// Base for a data consumer: the service side of the pipe is
    /// INPUT.
    pub fn consumer(config: PipeConfig, handler: H) -> Self {
        Self {
            config,
            server_socket: PipeSocket::Input,
            handler: Some(handler),
            server: None,
            client: None,
        }
    }

    /// The pipe configuration.
    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    fn channel_config(&self) -> ChannelConfig {
        // High water mark tuning: generous on the flowing side.
        let flowing = i32::from(self.config.batch_size / 2) + 5;
        let (rcvhwm, sndhwm) = match self.server_socket {
            PipeSocket::Output => (5, flowing),
            PipeSocket::Input => (flowing, 5),
        };
        ChannelConfig::wait_for(Direction::IN).with_hwm(rcvhwm, sndhwm)
    }
}

impl<H: PipeHandler> ServiceImpl for DataPipeService<H> {
    fn register(&mut self, rt: &mut Runtime) -> Result<()> {
        self.config.validate()?;
        let handler = self
            .handler
            .take()
            .ok_or_else(|| Error::service("data pipe service already registered"))?;
        let events = PipeEndEvents::new(handler, &self.config, self.server_socket, rt);
        match self.config.pipe_mode {
            SocketMode::Bind => {
                let mut protocol = FbdpServer::new(events);
                protocol.options.batch_size = self.config.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    PIPE_CHN,
                    protocol,
                    self.channel_config(),
                )?;
                channel.borrow_mut().protocol_mut().events.server_channel =
                    Some(Rc::downgrade(&channel));
                rt.endpoints
                    .insert(PIPE_CHN.to_string(), vec![self.config.pipe_address.clone()]);
                self.server = Some(channel);
            }
            SocketMode::Connect => {
                let mut protocol = FbdpClient::new(events);
                protocol.options.batch_size = self.config.batch_size;
                let channel = rt.mngr.create_channel(
                    SocketKind::Dealer,
                    PIPE_CHN,
                    protocol,
                    self.channel_config(),
                )?;
                self.client = Some(channel);
            }
            SocketMode::Unknown => {
                return Err(Error::config("pipe mode not configured"));
            }
        }
        Ok(())
    }

    fn acquire_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        // Connect to the data pipe and OPEN it
        if let Some(client) = &self.client {
            let mut channel = client.borrow_mut();
            let rid = channel
                .connect(&self.config.pipe_address, None)?
                .ok_or_else(|| Error::channel("pipe connect created no session"))?;
            let format = self
                .config
                .pipe_format
                .clone()
                .ok_or_else(|| Error::config("'pipe_format' required for connect pipe mode"))?;
            // A producing client attaches to the server INPUT, a
            // consuming client to the server OUTPUT.
            let client_socket = self.server_socket.peer();
            let (core, protocol, sessions) = channel.parts();
            protocol.send_open(
                core,
                sessions,
                &rid,
                &self.config.pipe,
                client_socket,
                &format,
                None,
            )?;
        }
        Ok(())
    }

    fn release_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        // CLOSE all active pipe sessions. A shutdown with open pipes is
        // abnormal, so the peers get an error code.
        if let Some(server) = &self.server {
            let mut channel = server.borrow_mut();
            let (core, protocol, sessions) = channel.parts();
            for rid in sessions.routing_ids() {
                if let Err(err) = protocol.send_close(core, sessions, &rid, ErrorCode::Error, None)
                {
                    tracing::debug!(error = %err, "pipe close on release failed");
                }
            }
        }
        if let Some(client) = &self.client {
            let mut channel = client.borrow_mut();
            let (core, protocol, sessions) = channel.parts();
            for rid in sessions.routing_ids() {
                if let Err(err) = protocol.send_close(core, sessions, &rid, ErrorCode::Error, None)
                {
                    tracing::debug!(error = %err, "pipe close on release failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str) -> ConfigTable {
        toml::from_str(source).unwrap()
    }

    #[test]
    fn test_pipe_config_load() {
        let cfg = PipeConfig::load(&table(
            r#"
            pipe = "data-1"
            pipe_address = "tcp://127.0.0.1:*"
            pipe_mode = "bind"
            batch_size = 10
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.pipe, "data-1");
        assert_eq!(cfg.pipe_mode, SocketMode::Bind);
        assert_eq!(cfg.batch_size, 10);
        assert!(cfg.stop_on_close);
        assert_eq!(cfg.ready_schedule_interval, READY_SCHEDULE_INTERVAL_MS);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_pipe_config_rejects_unknown_option() {
        let result = PipeConfig::load(&table(
            r#"
            pipe = "data-1"
            pipe_address = "inproc://p"
            pipe_mode = "bind"
            pipe_sise = 1
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_connect_mode_requires_format() {
        let cfg = PipeConfig::load(&table(
            r#"
            pipe = "data-1"
            pipe_address = "inproc://p"
            pipe_mode = "connect"
            "#,
        ))
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_mode_rejected() {
        let result = PipeConfig::load(&table(
            r#"
            pipe = "data-1"
            pipe_address = "inproc://p"
            pipe_mode = "listen"
            "#,
        ));
        assert!(result.is_err());
    }
}
