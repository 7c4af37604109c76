//! Microservice runtime: warm-up, event loop and lifecycle.
//!
//! A component pairs user service logic ([`ServiceImpl`]) with the
//! shared [`Runtime`] (channel manager, scheduler, stop token, peer
//! identity, endpoint map and execution state). [`MicroService`]
//! drives the common lifecycle: ICCP control-channel setup, socket
//! warm-up, endpoint binding, resource acquisition, the cooperative
//! I/O loop, and graceful or aborted teardown.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use ferrobus_core::channel::{Channel, ChannelConfig, ManagedChannel};
use ferrobus_core::endpoint::ZmqAddress;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::manager::ChannelManager;
use ferrobus_core::protocol::ProtocolMessage;
use ferrobus_core::session::Session;
use ferrobus_core::types::{
    Direction, EndpointMap, Outcome, PeerDescriptor, ServiceDescriptor, SocketKind, State,
};
use ferrobus_proto::iccp::{IccpComponent, IccpComponentEvents};

use crate::config::ConfigTable;
use crate::scheduler::SchedulerHandle;

/// Control channel name.
pub const SVC_CTRL: &str = "iccp";

/// Cooperative cancellation token.
///
/// Set by the ICCP STOP handler, by the component itself on graceful
/// end of data, or by a controller as the best-effort terminate path.
/// The event loop polls it at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// New unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the component to stop.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution outcome of a component run, shared between the runtime
/// and the protocol hooks that may record failures.
#[derive(Debug, Default)]
pub struct ExecutionState {
    /// Terminal status.
    pub outcome: Outcome,
    /// Outcome details (error descriptions on failure).
    pub details: Vec<String>,
}

impl ExecutionState {
    /// Record a failure, overriding any earlier outcome.
    pub fn note_error(&mut self, err: &Error) {
        self.outcome = Outcome::Error;
        self.details = vec![err.to_string()];
    }
}

/// Shared runtime of one component.
pub struct Runtime {
    /// Channel manager of this component.
    pub mngr: ChannelManager,
    /// Scheduler driven by the event loop.
    pub scheduler: SchedulerHandle,
    /// Stop signal polled by the event loop.
    pub stop: StopToken,
    /// Peer descriptor of this component instance.
    pub peer: PeerDescriptor,
    /// Service descriptor.
    pub descriptor: ServiceDescriptor,
    /// Endpoints this component binds: channel name → address list.
    /// Wildcards are resolved in place during warm-up.
    pub endpoints: EndpointMap,
    /// Component lifecycle state.
    pub state: State,
    exec: Rc<RefCell<ExecutionState>>,
}

impl Runtime {
    fn new(
        ctx: zmq::Context,
        descriptor: ServiceDescriptor,
        peer_uid: Option<Uuid>,
        stop: StopToken,
    ) -> Self {
        Self {
            mngr: ChannelManager::new(ctx),
            scheduler: SchedulerHandle::new(),
            stop,
            peer: PeerDescriptor::new(peer_uid.unwrap_or_else(Uuid::new_v4)),
            descriptor,
            endpoints: EndpointMap::new(),
            state: State::Unknown,
            exec: Rc::new(RefCell::new(ExecutionState::default())),
        }
    }

    /// Shared execution state handle for protocol event adapters.
    pub fn execution(&self) -> Rc<RefCell<ExecutionState>> {
        self.exec.clone()
    }

    /// Current outcome.
    pub fn outcome(&self) -> Outcome {
        self.exec.borrow().outcome
    }

    /// Current outcome details.
    pub fn details(&self) -> Vec<String> {
        self.exec.borrow().details.clone()
    }

    /// Record a failure in the execution state.
    pub fn note_error(&self, err: &Error) {
        self.exec.borrow_mut().note_error(err);
    }

    /// Bind all registered endpoints, resolving wildcards back into
    /// the endpoint map.
    pub fn bind_endpoints(&mut self) -> Result<()> {
        for (name, addresses) in &mut self.endpoints {
            let channel = self
                .mngr
                .channel(name)
                .ok_or_else(|| Error::channel(format!("no channel '{name}' to bind")))?;
            for address in addresses.iter_mut() {
                *address = channel.borrow_mut().bind(address)?;
            }
        }
        Ok(())
    }
}

/// Service logic hosted by a [`MicroService`].
pub trait ServiceImpl: 'static {
    /// Assemble the component: create channels and register the
    /// endpoints to bind. Called once, before warm-up.
    fn register(&mut self, rt: &mut Runtime) -> Result<()>;

    /// Acquire resources required by the component (open files,
    /// connect pipes to other services).
    fn acquire_resources(&mut self, rt: &mut Runtime) -> Result<()> {
        let _ = rt;
        Ok(())
    }

    /// Release resources acquired by the component.
    fn release_resources(&mut self, rt: &mut Runtime) -> Result<()> {
        let _ = rt;
        Ok(())
    }

    /// Start normal component activities.
    fn start_activities(&mut self, rt: &mut Runtime) -> Result<()> {
        let _ = rt;
        Ok(())
    }

    /// Stop component activities.
    fn stop_activities(&mut self, rt: &mut Runtime) -> Result<()> {
        let _ = rt;
        Ok(())
    }

    /// Apply a configuration requested by the controller at run time.
    fn handle_config_request(&mut self, config: &Bytes) -> Result<()> {
        let _ = config;
        Err(Error::service("component does not support run-time configuration"))
    }
}

/// Object-safe component contract driven by controllers.
pub trait Component {
    /// Verify configuration and assemble the component's structure.
    fn initialize(&mut self) -> Result<()>;

    /// Prepare for running: control channel, sockets, endpoints,
    /// resources, activities; report READY or ERROR to the controller.
    fn warm_up(&mut self, ctrl_addr: Option<&ZmqAddress>) -> Result<()>;

    /// Run the component event loop until stopped.
    fn run(&mut self) -> Result<()>;
}

/// Everything a component factory needs to build a component.
pub struct ComponentContext {
    /// Shared ZMQ context.
    pub zmq: zmq::Context,
    /// Service descriptor of the component.
    pub descriptor: ServiceDescriptor,
    /// Peer UID assigned by the controller, if any.
    pub peer_uid: Option<Uuid>,
    /// Component configuration (already interpolated).
    pub config: ConfigTable,
    /// Stop token shared with the controller.
    pub stop: StopToken,
}

/// Factory building a component inside its worker thread.
pub type ComponentFactory = Arc<dyn Fn(ComponentContext) -> Result<Box<dyn Component>> + Send + Sync>;

struct CtrlEvents<S: ServiceImpl> {
    stop: StopToken,
    exec: Rc<RefCell<ExecutionState>>,
    inner: Weak<RefCell<S>>,
}

impl<S: ServiceImpl> IccpComponentEvents for CtrlEvents<S> {
    fn on_stop_component(&mut self, err: Option<&Error>) {
        if let Some(err) = err {
            self.exec.borrow_mut().note_error(err);
        }
        self.stop.set();
    }

    fn on_config_request(&mut self, config: &Bytes) -> Result<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.borrow_mut().handle_config_request(config),
            None => Err(Error::service("component is gone")),
        }
    }
}

type CtrlChannel<S> = Rc<RefCell<Channel<IccpComponent<CtrlEvents<S>>>>>;

/// A microservice: user service logic plus the shared runtime.
pub struct MicroService<S: ServiceImpl> {
    rt: Runtime,
    inner: Rc<RefCell<S>>,
    ctrl: Option<CtrlChannel<S>>,
}

impl<S: ServiceImpl> MicroService<S> {
    /// Create a component hosting `service`.
    pub fn new(
        ctx: zmq::Context,
        descriptor: ServiceDescriptor,
        peer_uid: Option<Uuid>,
        service: S,
        stop: StopToken,
    ) -> Self {
        Self {
            rt: Runtime::new(ctx, descriptor, peer_uid, stop),
            inner: Rc::new(RefCell::new(service)),
            ctrl: None,
        }
    }

    /// The shared runtime.
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// The shared runtime, mutably.
    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    /// The hosted service logic.
    pub fn service(&self) -> Rc<RefCell<S>> {
        self.inner.clone()
    }

    fn send_ctrl(&self, msg: &ferrobus_proto::iccp::IccpMessage) -> Result<()> {
        let Some(ctrl) = &self.ctrl else {
            return Ok(());
        };
        let mut channel = ctrl.borrow_mut();
        let (core, _proto, sessions) = channel.parts();
        let rid = sessions
            .single()
            .map(|session| session.routing_id().clone())
            .ok_or_else(|| Error::channel("control channel has no session"))?;
        core.send_frames(&msg.to_frames(), &rid)?;
        Ok(())
    }

    fn main_loop(&mut self) -> Result<()> {
        while !self.rt.stop.is_set() {
            let timeout = self.rt.scheduler.timeout_ms();
            let events = self.rt.mngr.wait(Some(timeout))?;
            if !events.is_empty() {
                // Messages from the service control channel have top priority
                if let Some(ctrl) = &self.ctrl {
                    if events
                        .iter()
                        .any(|(name, dir)| name == SVC_CTRL && dir.contains(Direction::IN))
                    {
                        ctrl.borrow_mut().receive(None)?;
                        if self.rt.stop.is_set() {
                            continue; // stop quickly
                        }
                    }
                }
                // Channels waiting for output have precedence
                if self.rt.mngr.has_pollout() {
                    for (name, dir) in &events {
                        if dir.contains(Direction::OUT) {
                            if let Some(channel) = self.rt.mngr.channel(name) {
                                channel.borrow_mut().handle_output()?;
                            }
                        }
                    }
                }
                // Now process incoming messages
                for (name, dir) in &events {
                    if name != SVC_CTRL && dir.contains(Direction::IN) {
                        if let Some(channel) = self.rt.mngr.channel(name) {
                            channel.borrow_mut().handle_input()?;
                        }
                    }
                }
            }
            // Now it's time for scheduled actions
            self.rt.scheduler.run_scheduled();
        }
        Ok(())
    }
}

impl<S: ServiceImpl> Component for MicroService<S> {
    fn initialize(&mut self) -> Result<()> {
        let inner = self.inner.clone();
        inner.borrow_mut().register(&mut self.rt)?;
        self.rt.state = State::CREATED;
        Ok(())
    }

    fn warm_up(&mut self, ctrl_addr: Option<&ZmqAddress>) -> Result<()> {
        if let Some(_addr) = ctrl_addr {
            let events = CtrlEvents {
                stop: self.rt.stop.clone(),
                exec: self.rt.execution(),
                inner: Rc::downgrade(&self.inner),
            };
            let iccp = IccpComponent::new(events, cfg!(debug_assertions));
            let channel = self.rt.mngr.create_channel(
                SocketKind::Pair,
                SVC_CTRL,
                iccp,
                ChannelConfig::wait_for(Direction::IN).with_hwm(5, 5),
            )?;
            self.ctrl = Some(channel);
        }
        self.rt.mngr.warm_up()?;
        if let (Some(ctrl), Some(addr)) = (&self.ctrl, ctrl_addr) {
            let mut channel = ctrl.borrow_mut();
            channel.connect(addr, None)?;
            if !channel.core().can_send(0) {
                return Err(Error::service("broken component control channel"));
            }
        }
        let inner = self.inner.clone();
        let result = self
            .rt
            .bind_endpoints()
            .and_then(|()| inner.borrow_mut().acquire_resources(&mut self.rt))
            .and_then(|()| inner.borrow_mut().start_activities(&mut self.rt));
        match result {
            Ok(()) => {
                if let Some(ctrl) = &self.ctrl {
                    let ready = ctrl
                        .borrow()
                        .protocol()
                        .ready_msg(&self.rt.peer, &self.rt.endpoints);
                    self.send_ctrl(&ready)?;
                }
                self.rt.state = State::Ready;
                tracing::info!(peer = %self.rt.peer.uid, "component ready");
                Ok(())
            }
            Err(err) => {
                if let Some(ctrl) = &self.ctrl {
                    let report = ctrl.borrow().protocol().error_msg(&err);
                    if let Err(send_err) = self.send_ctrl(&report) {
                        tracing::warn!(error = %send_err, "failed to report warm-up error");
                    }
                }
                self.rt.mngr.shutdown(false);
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        self.rt.state = State::Running;
        tracing::info!(peer = %self.rt.peer.uid, "component running");
        let inner = self.inner.clone();
        let result = self.main_loop().and_then(|()| {
            // Gracefully stop the service
            self.rt.state = State::STOPPED;
            inner.borrow_mut().stop_activities(&mut self.rt)?;
            inner.borrow_mut().release_resources(&mut self.rt)?;
            if self.rt.outcome() == Outcome::Unknown {
                self.rt.exec.borrow_mut().outcome = Outcome::Ok;
            }
            if let Some(ctrl) = &self.ctrl {
                let finished = ctrl
                    .borrow()
                    .protocol()
                    .finished_msg(self.rt.outcome(), self.rt.details());
                self.send_ctrl(&finished)?;
            }
            self.rt.mngr.shutdown(false);
            self.rt.state = State::Finished;
            tracing::info!(peer = %self.rt.peer.uid, outcome = %self.rt.outcome(), "component finished");
            Ok(())
        });
        if let Err(err) = &result {
            self.rt.state = State::Aborted;
            tracing::error!(peer = %self.rt.peer.uid, error = %err, "component aborted");
            if let Some(ctrl) = &self.ctrl {
                // try to send a report to the controller
                let report = ctrl.borrow().protocol().error_msg(err);
                if let Err(send_err) = self.send_ctrl(&report) {
                    tracing::debug!(error = %send_err, "abort report not delivered");
                }
            }
            self.rt.mngr.shutdown(true);
        }
        result
    }
}
