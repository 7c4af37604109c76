//! FBSP handshake and API dispatch over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::{uuid, Uuid};

use ferrobus_core::channel::{Channel, ChannelConfig, ChannelCore};
use ferrobus_core::error::Result;
use ferrobus_core::protocol::ProtocolMessage;
use ferrobus_core::session::Session;
use ferrobus_core::types::{
    AgentDescriptor, InterfaceDescriptor, PeerDescriptor, Received, RoutingId, ServiceDescriptor,
    SocketKind, VENDOR_UID,
};
use ferrobus_proto::fbsp::{
    request_code, ErrorCode, FbspClient, FbspMessage, FbspService, FbspServiceEvents, FbspSession,
    MsgType,
};

const ECHO_INTERFACE: Uuid = uuid!("53a1e7c2-30a8-47fd-9125-6c5b4bf2cd1e");
const API_ECHO: u8 = 1;

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        agent: AgentDescriptor::new(
            uuid!("6a3bb2a1-bd39-4d4e-97a5-0d3f2c8a11fe"),
            "echo-service",
            "1.0.0",
            VENDOR_UID,
            "test/echo",
        ),
        api: vec![InterfaceDescriptor { uid: ECHO_INTERFACE, name: "echo".to_string() }],
        description: "test echo service".to_string(),
        facilities: vec![],
        factory: "tests.echo_service".to_string(),
        config_factory: "tests.echo_service_config".to_string(),
    }
}

struct EchoEvents {
    requests: Arc<AtomicUsize>,
}

impl FbspServiceEvents for EchoEvents {}

fn echo_handler(
    events: &mut EchoEvents,
    channel: &mut ChannelCore,
    session: &mut FbspSession,
    msg: &FbspMessage,
) -> Result<()> {
    events.requests.fetch_add(1, Ordering::SeqCst);
    let reply = FbspMessage::reply_for(msg);
    channel.send_frames(&reply.to_frames(), session.routing_id())
}

struct Harness {
    service: Channel<FbspService<EchoEvents>>,
    client: Channel<FbspClient>,
    requests: Arc<AtomicUsize>,
    _ctx: zmq::Context,
}

fn harness(endpoint: &str) -> Harness {
    let ctx = zmq::Context::new();
    let requests = Arc::new(AtomicUsize::new(0));
    let peer = PeerDescriptor::new(Uuid::new_v4());
    let mut protocol = FbspService::new(
        &descriptor(),
        &peer,
        EchoEvents { requests: requests.clone() },
    );
    protocol
        .register_api_handler(ECHO_INTERFACE, API_ECHO, echo_handler)
        .unwrap();
    let mut service = Channel::new(
        SocketKind::Router,
        "svc",
        protocol,
        ChannelConfig::default(),
    )
    .unwrap();
    service.core_mut().warm_up(&ctx).unwrap();
    service.bind(&endpoint.parse().unwrap()).unwrap();

    let mut client = Channel::new(
        SocketKind::Dealer,
        "cli",
        FbspClient::new(),
        ChannelConfig::default(),
    )
    .unwrap();
    client.core_mut().warm_up(&ctx).unwrap();
    client.connect(&endpoint.parse().unwrap(), None).unwrap();

    Harness { service, client, requests, _ctx: ctx }
}

fn client_hello(harness: &mut Harness, token: [u8; 8]) {
    let agent = AgentDescriptor::new(
        Uuid::new_v4(),
        "echo-client",
        "1.0.0",
        VENDOR_UID,
        "test/client",
    );
    let peer = PeerDescriptor::new(Uuid::new_v4());
    let rid = RoutingId::internal();
    let (core, protocol, _sessions) = harness.client.parts();
    protocol.send_hello(core, &rid, &agent, &peer, token).unwrap();
}

#[test]
fn test_handshake_and_api_call() {
    let mut h = harness("inproc://fbsp-s3");
    let token = *b"token-01";
    client_hello(&mut h, token);

    // Service accepts the client, captures the greeting and replies WELCOME
    assert!(matches!(h.service.receive(Some(1000)).unwrap(), Received::Handled));
    assert_eq!(h.service.sessions().len(), 1);
    {
        let session = h.service.sessions().iter().next().unwrap();
        let greeting = session.greeting.as_ref().expect("greeting captured");
        assert_eq!(greeting.msg_type, MsgType::Hello);
        assert_eq!(greeting.token, token);
        assert!(session.partner_uid.is_some());
    }

    // Client captures the WELCOME with the advertised interface map
    let welcome = h
        .client
        .receive(Some(1000))
        .unwrap()
        .into_message()
        .expect("welcome passed to caller");
    assert_eq!(welcome.msg_type, MsgType::Welcome);
    assert_eq!(welcome.token, token);
    assert!(h.client.protocol().has_api(&ECHO_INTERFACE));

    // Registered API handler is invoked exactly once with the request
    let token2 = *b"token-02";
    let request = h
        .client
        .protocol()
        .create_request_for(&ECHO_INTERFACE, API_ECHO, token2)
        .unwrap();
    assert_eq!(request.type_data, request_code(0, API_ECHO));
    h.client.send(&request, &RoutingId::internal()).unwrap();

    assert!(matches!(h.service.receive(Some(1000)).unwrap(), Received::Handled));
    assert_eq!(h.requests.load(Ordering::SeqCst), 1);

    let reply = h
        .client
        .receive(Some(1000))
        .unwrap()
        .into_message()
        .expect("reply passed to caller");
    assert_eq!(reply.msg_type, MsgType::Reply);
    assert_eq!(reply.token, token2);
    assert_eq!(reply.type_data, request.type_data);
}

#[test]
fn test_unknown_api_code_yields_not_implemented() {
    let mut h = harness("inproc://fbsp-s4");
    let token = *b"token-11";
    client_hello(&mut h, token);
    assert!(matches!(h.service.receive(Some(1000)).unwrap(), Received::Handled));
    h.client.receive(Some(1000)).unwrap().into_message().unwrap();

    // REQUEST with unregistered code
    let token2 = *b"token-12";
    let request = FbspMessage::new(MsgType::Request, token2, request_code(0, 99));
    h.client.send(&request, &RoutingId::internal()).unwrap();
    assert!(h.service.receive(Some(1000)).unwrap().is_invalid());
    assert_eq!(h.requests.load(Ordering::SeqCst), 0);

    let error = h
        .client
        .receive(Some(1000))
        .unwrap()
        .into_message()
        .expect("error passed to caller");
    assert_eq!(error.msg_type, MsgType::Error);
    assert_eq!(error.error_code(), Some(ErrorCode::NotImplemented));
    assert_eq!(error.relates_to(), Some(MsgType::Request));
    assert_eq!(error.token, token2);
}

#[test]
fn test_session_requires_hello() {
    let mut h = harness("inproc://fbsp-no-hello");
    // First message is a REQUEST: the session must be refused
    let request = FbspMessage::new(MsgType::Request, *b"token-21", request_code(0, 1));
    h.client.send(&request, &RoutingId::internal()).unwrap();
    assert!(h.service.receive(Some(1000)).unwrap().is_invalid());
    assert!(h.service.sessions().is_empty());

    let error = h
        .client
        .receive(Some(1000))
        .unwrap()
        .into_message()
        .expect("refusal reported");
    assert_eq!(error.msg_type, MsgType::Error);
    assert_eq!(error.error_code(), Some(ErrorCode::ProtocolViolation));
}

#[test]
fn test_close_discards_session() {
    let mut h = harness("inproc://fbsp-close");
    client_hello(&mut h, *b"token-31");
    assert!(matches!(h.service.receive(Some(1000)).unwrap(), Received::Handled));
    h.client.receive(Some(1000)).unwrap().into_message().unwrap();
    assert_eq!(h.service.sessions().len(), 1);

    {
        let (core, protocol, sessions) = h.client.parts();
        protocol.send_close(core, sessions, &RoutingId::internal()).unwrap();
    }
    assert!(matches!(h.service.receive(Some(1000)).unwrap(), Received::Handled));
    assert!(h.service.sessions().is_empty());
}
