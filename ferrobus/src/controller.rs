//! Component controllers.
//!
//! A controller owns an ICCP control channel and supervises one
//! component: [`DirectController`] runs it on the current thread with
//! an interrupt-to-STOP bridge, [`ThreadController`] hosts it in a
//! worker thread with timed start/stop, a best-effort terminate path
//! and outcome reporting.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use uuid::Uuid;

use ferrobus_core::channel::{Channel, ChannelConfig};
use ferrobus_core::endpoint::ZmqAddress;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::manager::ChannelManager;
use ferrobus_core::protocol::ProtocolMessage;
use ferrobus_core::types::{
    Direction, EndpointMap, Outcome, PeerDescriptor, Received, RoutingId, ServiceDescriptor,
    SocketKind,
};
use ferrobus_proto::iccp::{IccpController, IccpMessage};

use crate::config::ConfigTable;
use crate::micro::{Component, ComponentContext, ComponentFactory, StopToken, SVC_CTRL};
use crate::registry::RegisteredService;

type CtrlChannel = Rc<RefCell<Channel<IccpController>>>;

/// Common controller state: identity, configuration and the outcome
/// captured from the component's FINISHED report.
pub struct ServiceController {
    /// Instance name (defaults to the service agent name).
    pub name: String,
    /// Peer UID assigned to the component instance.
    pub peer_uid: Uuid,
    /// Service descriptor.
    pub descriptor: ServiceDescriptor,
    /// Outcome captured from FINISHED, or `Error` on failure paths.
    pub outcome: Outcome,
    /// Outcome details.
    pub details: Vec<String>,
    /// Peer descriptor captured from READY.
    pub peer: Option<PeerDescriptor>,
    /// Bound endpoints captured from READY.
    pub endpoints: EndpointMap,
    zmq: zmq::Context,
    service: RegisteredService,
    config: ConfigTable,
    ctrl_addr: ZmqAddress,
    mngr: ChannelManager,
    channel: Option<CtrlChannel>,
    stop_token: StopToken,
}

impl ServiceController {
    fn new(
        zmq: zmq::Context,
        service: &RegisteredService,
        name: Option<&str>,
        peer_uid: Option<Uuid>,
    ) -> Self {
        let name = name.unwrap_or(&service.descriptor.agent.name).to_string();
        let ctrl_addr: ZmqAddress = format!("inproc://{}", Uuid::new_v4().simple())
            .parse()
            .expect("generated control address is valid");
        Self {
            name,
            peer_uid: peer_uid.unwrap_or_else(Uuid::new_v4),
            descriptor: service.descriptor.clone(),
            outcome: Outcome::Unknown,
            details: Vec::new(),
            peer: None,
            endpoints: EndpointMap::new(),
            mngr: ChannelManager::new(zmq.clone()),
            zmq,
            service: service.clone(),
            config: ConfigTable::new(),
            ctrl_addr,
            channel: None,
            stop_token: StopToken::new(),
        }
    }

    /// Load and validate the component configuration (fail early).
    pub fn configure(&mut self, config: ConfigTable) -> Result<()> {
        (self.service.config_check)(&config)?;
        self.config = config;
        Ok(())
    }

    /// Stop token shared with the component.
    pub fn stop_token(&self) -> StopToken {
        self.stop_token.clone()
    }

    fn create_control_channel(&mut self) -> Result<CtrlChannel> {
        let channel = self.mngr.create_channel(
            SocketKind::Pair,
            SVC_CTRL,
            IccpController::default(),
            ChannelConfig::wait_for(Direction::IN).with_hwm(5, 5),
        )?;
        self.mngr.warm_up()?;
        channel.borrow_mut().bind(&self.ctrl_addr)?;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    fn component_context(&self) -> ComponentContext {
        ComponentContext {
            zmq: self.zmq.clone(),
            descriptor: self.descriptor.clone(),
            peer_uid: Some(self.peer_uid),
            config: self.config.clone(),
            stop: self.stop_token.clone(),
        }
    }

    /// Receive one control message within `timeout_ms`.
    fn poll_control(&self, timeout_ms: i64) -> Result<Option<IccpMessage>> {
        let Some(channel) = &self.channel else {
            return Err(Error::channel("controller has no control channel"));
        };
        let mut channel = channel.borrow_mut();
        if !channel.core().wait(timeout_ms)?.contains(Direction::IN) {
            return Ok(None);
        }
        match channel.receive(None)? {
            Received::Message(msg) => Ok(Some(msg)),
            Received::Timeout => Ok(None),
            _ => Err(Error::service("invalid response from service")),
        }
    }

    /// Handle the startup response: READY captures peer and endpoints,
    /// anything else is a failure.
    fn expect_ready(&mut self, msg: IccpMessage) -> Result<()> {
        match msg {
            IccpMessage::Ready { peer, endpoints } => {
                self.peer = Some(peer);
                self.endpoints = endpoints;
                Ok(())
            }
            IccpMessage::Error(error) => Err(Error::service(error)),
            _ => Err(Error::service("ICCP protocol error - unexpected message")),
        }
    }

    /// Record a FINISHED/ERROR report in the outcome fields.
    fn record_report(&mut self, msg: IccpMessage) -> Result<()> {
        match msg {
            IccpMessage::Finished { outcome, details } => {
                self.outcome = outcome;
                self.details = details;
                Ok(())
            }
            IccpMessage::Error(error) => {
                self.outcome = Outcome::Error;
                self.details = vec![error.clone()];
                Err(Error::service(error))
            }
            _ => Err(Error::service("ICCP protocol error - unexpected message")),
        }
    }

    fn send_stop(&self) -> Result<()> {
        let Some(channel) = &self.channel else {
            return Err(Error::channel("controller has no control channel"));
        };
        let mut channel = channel.borrow_mut();
        let stop = channel.protocol().stop_msg();
        let (core, _proto, _sessions) = channel.parts();
        core.send_frames(&stop.to_frames(), &RoutingId::internal())
    }

    fn shutdown(&mut self) {
        self.mngr.shutdown(true);
        self.channel = None;
    }
}

/// Controller that runs the component on the current thread.
///
/// Although ICCP drives start and stop, no ICCP interaction is
/// possible while the component runs; the component is stopped through
/// the interrupt handler installed for the duration of the run, which
/// trips the component's stop token.
pub struct DirectController {
    /// Common controller state.
    pub state: ServiceController,
}

impl DirectController {
    /// Controller for one service instance.
    pub fn new(
        zmq: zmq::Context,
        service: &RegisteredService,
        name: Option<&str>,
        peer_uid: Option<Uuid>,
    ) -> Self {
        Self { state: ServiceController::new(zmq, service, name, peer_uid) }
    }

    /// Load and validate the component configuration.
    pub fn configure(&mut self, config: ConfigTable) -> Result<()> {
        self.state.configure(config)
    }

    /// Start the service and run it until it stops.
    ///
    /// Does not return until the component finishes (usually after an
    /// interrupt) or an error is raised.
    pub fn start(&mut self) -> Result<()> {
        self.state.create_control_channel()?;
        let result = self.run_component();
        self.state.shutdown();
        result
    }

    fn run_component(&mut self) -> Result<()> {
        let mut component = (self.state.service.factory)(self.state.component_context())?;
        component.initialize()?;
        component.warm_up(Some(&self.state.ctrl_addr.clone()))?;
        match self.state.poll_control(1000)? {
            Some(msg) => self.state.expect_ready(msg)?,
            None => return Err(Error::service("service did not start in time")),
        }
        // Interrupts request a cooperative stop for the duration of
        // the run; the handler stays installed but turns inert once
        // the token belongs to a finished component.
        let stop = self.state.stop_token();
        if let Err(err) = ctrlc::set_handler(move || stop.set()) {
            tracing::warn!(error = %err, "interrupt handler not installed");
        }
        component.run()?;
        match self.state.poll_control(100)? {
            Some(msg) => {
                if let Err(err) = self.state.record_report(msg) {
                    return Err(err);
                }
            }
            None => tracing::warn!("service shutdown not confirmed"),
        }
        Ok(())
    }
}

/// Controller that runs the component in a worker thread.
pub struct ThreadController {
    /// Common controller state.
    pub state: ServiceController,
    worker: Option<JoinHandle<()>>,
}

/// Thread target: build, initialize and run the component.
///
/// Failures before the component's own control channel exists are
/// reported over a throwaway PAIR socket so the controller does not
/// have to wait for its timeout.
fn service_thread(factory: ComponentFactory, context: ComponentContext, ctrl_addr: ZmqAddress) {
    let zmq = context.zmq.clone();
    let component = factory(context).and_then(|mut component| {
        component.initialize()?;
        Ok(component)
    });
    let mut component = match component {
        Ok(component) => component,
        Err(err) => {
            tracing::error!(error = %err, "component initialization failed");
            if let Ok(pipe) = zmq.socket(zmq::PAIR) {
                let _ = pipe.set_immediate(true);
                let _ = pipe.set_linger(5000);
                let _ = pipe.set_sndtimeo(5000);
                if pipe.connect(ctrl_addr.as_str()).is_ok() {
                    let report = IccpMessage::Error(err.to_string());
                    let frames = report.to_frames();
                    let _ = pipe.send_multipart(frames.iter().map(|frame| frame.as_ref()), 0);
                }
            }
            return;
        }
    };
    if let Err(err) = component.warm_up(Some(&ctrl_addr)) {
        tracing::error!(error = %err, "component warm-up failed");
        return;
    }
    if let Err(err) = component.run() {
        tracing::error!(error = %err, "component run failed");
    }
}

impl ThreadController {
    /// Controller for one service instance.
    pub fn new(
        zmq: zmq::Context,
        service: &RegisteredService,
        name: Option<&str>,
        peer_uid: Option<Uuid>,
    ) -> Self {
        Self {
            state: ServiceController::new(zmq, service, name, peer_uid),
            worker: None,
        }
    }

    /// Load and validate the component configuration.
    pub fn configure(&mut self, config: ConfigTable) -> Result<()> {
        self.state.configure(config)
    }

    /// Returns true while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Start the service and wait up to `timeout_ms` for it to report
    /// READY.
    ///
    /// # Errors
    ///
    /// Returns a service error on a failed or refused start, the
    /// timeout error when the service does not report in time.
    pub fn start(&mut self, timeout_ms: i64) -> Result<()> {
        let result = self.start_inner(timeout_ms);
        if result.is_err() {
            self.state.shutdown();
        }
        result
    }

    fn start_inner(&mut self, timeout_ms: i64) -> Result<()> {
        self.state.create_control_channel()?;
        let factory = self.state.service.factory.clone();
        let context = self.state.component_context();
        let ctrl_addr = self.state.ctrl_addr.clone();
        let name = self.state.name.clone();
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || service_thread(factory, context, ctrl_addr))
            .map_err(|err| Error::service(format!("worker spawn failed: {err}")))?;
        self.worker = Some(worker);
        match self.state.poll_control(timeout_ms)? {
            Some(msg) => self.state.expect_ready(msg)?,
            None if !self.is_running() => {
                return Err(Error::service("service start failed for unknown reason"));
            }
            None => return Err(Error::Timeout),
        }
        tracing::info!(service = self.state.name.as_str(), "service started");
        Ok(())
    }

    /// Stop the service. Does nothing if the service is not running.
    ///
    /// Sends STOP, waits up to `timeout_ms` for FINISHED or ERROR,
    /// then joins the worker within the remaining time.
    ///
    /// # Errors
    ///
    /// Returns a service error on an invalid or negative response and
    /// the timeout error when the worker does not stop in time.
    pub fn stop(&mut self, timeout_ms: Option<i64>) -> Result<()> {
        let result = self.stop_inner(timeout_ms);
        self.state.shutdown();
        result
    }

    fn stop_inner(&mut self, timeout_ms: Option<i64>) -> Result<()> {
        let started = Instant::now();
        if self.is_running() {
            self.state.send_stop()?;
            match self.state.poll_control(timeout_ms.unwrap_or(-1))? {
                Some(msg) => self.state.record_report(msg)?,
                None => tracing::warn!("service shutdown not confirmed"),
            }
            let remaining = timeout_ms.map(|timeout| {
                let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                (timeout - elapsed).max(0)
            });
            self.join_worker(remaining)
        } else {
            // Non-blocking drain of any pending final report.
            match self.state.poll_control(0)? {
                Some(msg) => self.state.record_report(msg),
                None => Ok(()),
            }
        }
    }

    /// Terminate the service, best effort.
    ///
    /// Only to be used after a failed [`stop`](Self::stop): trips the
    /// component's cancel token and waits briefly for the worker to
    /// unwind.
    ///
    /// # Errors
    ///
    /// Returns a service error when the worker is still alive
    /// afterwards.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.state.stop_token.set();
        self.join_worker(Some(5000))
            .map_err(|_| Error::service("service termination failed"))
    }

    /// Wait until the service stops.
    pub fn join(&mut self, timeout_ms: Option<i64>) -> Result<()> {
        self.join_worker(timeout_ms)
    }

    fn join_worker(&mut self, timeout_ms: Option<i64>) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms.max(0) as u64));
        while !worker.is_finished() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.worker = Some(worker);
                    return Err(Error::Timeout);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = worker.join();
        Ok(())
    }
}
