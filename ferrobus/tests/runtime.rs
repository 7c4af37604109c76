//! Controller/component lifecycle over the ICCP control channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::{uuid, Uuid};

use ferrobus::config::ConfigTable;
use ferrobus::controller::ThreadController;
use ferrobus::micro::{Component, ComponentContext, MicroService, Runtime, ServiceImpl};
use ferrobus::registry::{RegisteredService, ServiceRegistry};
use ferrobus_core::channel::ChannelConfig;
use ferrobus_core::error::Result;
use ferrobus_core::message::SimpleMessage;
use ferrobus_core::protocol::{DispatchKey, HandlerMap, Protocol};
use ferrobus_core::session::{SessionBase, SessionStore};
use ferrobus_core::types::{AgentDescriptor, Outcome, SocketKind, VENDOR_UID};

/// Protocol that ignores everything; the idle service only exercises
/// lifecycle plumbing.
struct IdleProtocol {
    handlers: HandlerMap<IdleProtocol>,
}

impl IdleProtocol {
    fn new() -> Self {
        let mut handlers = HandlerMap::new();
        handlers.set(DispatchKey::Any, Self::on_any as _);
        Self { handlers }
    }

    fn on_any(
        _proto: &mut Self,
        _chn: &mut ferrobus_core::channel::ChannelCore,
        _sessions: &mut SessionStore<SessionBase>,
        _rid: &ferrobus_core::types::RoutingId,
        _msg: &SimpleMessage,
    ) -> Result<Option<SimpleMessage>> {
        Ok(None)
    }
}

impl Protocol for IdleProtocol {
    type Session = SessionBase;
    type Message = SimpleMessage;

    fn handlers(&self) -> &HandlerMap<Self> {
        &self.handlers
    }
}

/// Service that binds one wildcard endpoint and then idles.
struct IdleService {
    activity: Arc<ActivityLog>,
}

#[derive(Default)]
struct ActivityLog {
    acquired: AtomicUsize,
    released: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl ServiceImpl for IdleService {
    fn register(&mut self, rt: &mut Runtime) -> Result<()> {
        rt.mngr.create_channel(
            SocketKind::Pair,
            "svc",
            IdleProtocol::new(),
            ChannelConfig::default(),
        )?;
        rt.endpoints
            .insert("svc".to_string(), vec!["tcp://127.0.0.1:*".parse().unwrap()]);
        Ok(())
    }

    fn acquire_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        self.activity.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_resources(&mut self, _rt: &mut Runtime) -> Result<()> {
        self.activity.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_activities(&mut self, _rt: &mut Runtime) -> Result<()> {
        self.activity.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_activities(&mut self, _rt: &mut Runtime) -> Result<()> {
        self.activity.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn idle_registry(activity: Arc<ActivityLog>) -> ServiceRegistry {
    let descriptor = ferrobus_core::types::ServiceDescriptor {
        agent: AgentDescriptor::new(
            uuid!("3b946719-2a9c-4c0e-94f3-8e5a1c22d901"),
            "idle-service",
            "1.0.0",
            VENDOR_UID,
            "test/idle",
        ),
        api: vec![],
        description: "does nothing, politely".to_string(),
        facilities: vec![],
        factory: "tests.idle_service".to_string(),
        config_factory: "tests.idle_service_config".to_string(),
    };
    let mut registry = ServiceRegistry::new();
    registry
        .register(RegisteredService {
            descriptor,
            factory: Arc::new(move |context: ComponentContext| {
                let service = IdleService { activity: activity.clone() };
                Ok(Box::new(MicroService::new(
                    context.zmq,
                    context.descriptor,
                    context.peer_uid,
                    service,
                    context.stop,
                )) as Box<dyn Component>)
            }),
            config_check: Arc::new(|_config| Ok(())),
        })
        .unwrap();
    registry
}

/// S5: start captures READY with peer and resolved endpoints, STOP
/// yields FINISHED(OK) and the worker joins within the timeout.
#[test]
fn test_thread_controller_lifecycle() {
    ferrobus::dev_tracing::init_tracing();
    let activity = Arc::new(ActivityLog::default());
    let registry = idle_registry(activity.clone());
    let ctx = zmq::Context::new();
    let service = registry.iter().next().unwrap();
    let mut controller = ThreadController::new(ctx, service, None, Some(Uuid::new_v4()));
    controller.configure(ConfigTable::new()).unwrap();
    controller.start(10_000).unwrap();

    // READY captured the peer and the wildcard-resolved endpoint
    let peer = controller.state.peer.as_ref().expect("peer captured");
    assert_eq!(peer.uid, controller.state.peer_uid);
    let bound = &controller.state.endpoints["svc"];
    assert_eq!(bound.len(), 1);
    assert!(bound[0].as_str().starts_with("tcp://127.0.0.1:"));
    assert!(!bound[0].as_str().ends_with('*'));
    assert!(controller.is_running());
    assert_eq!(activity.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(activity.started.load(Ordering::SeqCst), 1);

    controller.stop(Some(10_000)).unwrap();
    assert_eq!(controller.state.outcome, Outcome::Ok);
    assert!(!controller.is_running());
    assert_eq!(activity.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(activity.released.load(Ordering::SeqCst), 1);
}

/// A component that fails to initialize reports the failure instead of
/// leaving the controller waiting for its timeout.
#[test]
fn test_failed_initialize_is_reported() {
    struct BrokenService;

    impl ServiceImpl for BrokenService {
        fn register(&mut self, _rt: &mut Runtime) -> Result<()> {
            Err(ferrobus_core::error::Error::config("missing vital option"))
        }
    }

    let descriptor = ferrobus_core::types::ServiceDescriptor {
        agent: AgentDescriptor::new(
            uuid!("b7a5cb12-80cd-49a1-93f8-21e6d5a4cc02"),
            "broken-service",
            "1.0.0",
            VENDOR_UID,
            "test/broken",
        ),
        api: vec![],
        description: "always fails".to_string(),
        facilities: vec![],
        factory: "tests.broken_service".to_string(),
        config_factory: "tests.broken_service_config".to_string(),
    };
    let mut registry = ServiceRegistry::new();
    registry
        .register(RegisteredService {
            descriptor,
            factory: Arc::new(|context: ComponentContext| {
                Ok(Box::new(MicroService::new(
                    context.zmq,
                    context.descriptor,
                    context.peer_uid,
                    BrokenService,
                    context.stop,
                )) as Box<dyn Component>)
            }),
            config_check: Arc::new(|_config| Ok(())),
        })
        .unwrap();

    let ctx = zmq::Context::new();
    let service = registry.iter().next().unwrap();
    let mut controller = ThreadController::new(ctx, service, None, None);
    controller.configure(ConfigTable::new()).unwrap();
    let err = controller.start(10_000).expect_err("start must fail");
    assert!(err.to_string().contains("missing vital option"));
}

/// Terminate trips the cooperative cancel token after a failed stop.
#[test]
fn test_terminate_after_start() {
    let activity = Arc::new(ActivityLog::default());
    let registry = idle_registry(activity);
    let ctx = zmq::Context::new();
    let service = registry.iter().next().unwrap();
    let mut controller = ThreadController::new(ctx, service, Some("idle-2"), None);
    controller.configure(ConfigTable::new()).unwrap();
    controller.start(10_000).unwrap();
    assert!(controller.is_running());
    controller.terminate().unwrap();
    assert!(!controller.is_running());
}
