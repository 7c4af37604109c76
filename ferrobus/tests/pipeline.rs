//! End-to-end data-pipe flows between components in worker threads.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use ferrobus::bundle::BundleController;
use ferrobus::config::{ConfigTable, SECTION_NET_ADDRESS};
use ferrobus::controller::ThreadController;
use ferrobus::data::filter::{DataFilterService, FilterConfig, FilterHandler};
use ferrobus::data::onepipe::{DataPipeService, PipeConfig, PipeHandler};
use ferrobus::micro::{Component, ComponentContext, MicroService};
use ferrobus::registry::{RegisteredService, ServiceRegistry};
use ferrobus_core::error::{Error, Result};
use ferrobus_core::types::{AgentDescriptor, Outcome, ServiceDescriptor, VENDOR_UID};
use ferrobus_proto::fbdp::{ErrorCode, FbdpMessage, FbdpPayload};
use uuid::{uuid, Uuid};

struct StaticProducer {
    items: Vec<Bytes>,
    next: usize,
}

impl PipeHandler for StaticProducer {
    fn produce_data(&mut self, msg: &mut FbdpMessage) -> Result<()> {
        if self.next >= self.items.len() {
            return Err(Error::stop(ErrorCode::Ok.as_u16(), "end of data"));
        }
        msg.payload = FbdpPayload::Data(Some(self.items[self.next].clone()));
        self.next += 1;
        Ok(())
    }
}

struct CollectingConsumer {
    sink: Arc<Mutex<Vec<Bytes>>>,
}

impl PipeHandler for CollectingConsumer {
    fn accept_data(&mut self, data: Option<&Bytes>) -> Result<()> {
        if let Some(data) = data {
            self.sink.lock().unwrap().push(data.clone());
        }
        Ok(())
    }
}

struct UppercaseFilter;

impl FilterHandler for UppercaseFilter {
    fn process_data(&mut self, data: Option<&Bytes>, produced: &mut Vec<Bytes>) -> Result<()> {
        if let Some(data) = data {
            produced.push(Bytes::from(data.to_ascii_uppercase()));
        }
        Ok(())
    }
}

fn descriptor(uid: Uuid, name: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        agent: AgentDescriptor::new(uid, name, "1.0.0", VENDOR_UID, "test/pipeline"),
        api: vec![],
        description: format!("{name} test service"),
        facilities: vec![],
        factory: format!("tests.{name}"),
        config_factory: format!("tests.{name}_config"),
    }
}

fn provider_entry(uid: Uuid, name: &str, items: &[&[u8]]) -> RegisteredService {
    let items: Vec<Bytes> = items.iter().map(|item| Bytes::copy_from_slice(item)).collect();
    RegisteredService {
        descriptor: descriptor(uid, name),
        factory: Arc::new(move |context: ComponentContext| {
            let config = PipeConfig::load(&context.config)?;
            let handler = StaticProducer { items: items.clone(), next: 0 };
            let service = DataPipeService::provider(config, handler);
            Ok(Box::new(MicroService::new(
                context.zmq,
                context.descriptor,
                context.peer_uid,
                service,
                context.stop,
            )) as Box<dyn Component>)
        }),
        config_check: Arc::new(|config| PipeConfig::load(config)?.validate()),
    }
}

fn consumer_entry(uid: Uuid, name: &str, sink: Arc<Mutex<Vec<Bytes>>>) -> RegisteredService {
    RegisteredService {
        descriptor: descriptor(uid, name),
        factory: Arc::new(move |context: ComponentContext| {
            let config = PipeConfig::load(&context.config)?;
            let handler = CollectingConsumer { sink: sink.clone() };
            let service = DataPipeService::consumer(config, handler);
            Ok(Box::new(MicroService::new(
                context.zmq,
                context.descriptor,
                context.peer_uid,
                service,
                context.stop,
            )) as Box<dyn Component>)
        }),
        config_check: Arc::new(|config| PipeConfig::load(config)?.validate()),
    }
}

fn filter_entry(uid: Uuid, name: &str) -> RegisteredService {
    RegisteredService {
        descriptor: descriptor(uid, name),
        factory: Arc::new(move |context: ComponentContext| {
            let config = FilterConfig::load(&context.config)?;
            let service = DataFilterService::new(config, UppercaseFilter);
            Ok(Box::new(MicroService::new(
                context.zmq,
                context.descriptor,
                context.peer_uid,
                service,
                context.stop,
            )) as Box<dyn Component>)
        }),
        config_check: Arc::new(|config| FilterConfig::load(config)?.validate()),
    }
}

fn table(source: &str) -> ConfigTable {
    toml::from_str(source).unwrap()
}

fn wait_for<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Provider (bind) feeds a consumer (connect); both stop on the normal
/// end-of-stream CLOSE.
#[test]
fn test_provider_to_consumer() {
    ferrobus::dev_tracing::init_tracing();
    let ctx = zmq::Context::new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let provider = provider_entry(
        uuid!("07b72b6e-6f24-4b8f-b6f0-cf2f25b0a101"),
        "feeder",
        &[b"alpha", b"beta", b"gamma"],
    );
    let consumer = consumer_entry(
        uuid!("6b9f2c44-7f89-49ea-9ad9-0a5be41ccd02"),
        "drain",
        sink.clone(),
    );

    let mut provider_ctl = ThreadController::new(ctx.clone(), &provider, None, None);
    provider_ctl
        .configure(table(
            r#"
            pipe = "pipe-1"
            pipe_address = "inproc://pipeline-feed"
            pipe_mode = "bind"
            batch_size = 2
            "#,
        ))
        .unwrap();
    provider_ctl.start(10_000).unwrap();

    let mut consumer_ctl = ThreadController::new(ctx, &consumer, None, None);
    consumer_ctl
        .configure(table(
            r#"
            pipe = "pipe-1"
            pipe_address = "inproc://pipeline-feed"
            pipe_mode = "connect"
            pipe_format = "text/plain"
            "#,
        ))
        .unwrap();
    consumer_ctl.start(10_000).unwrap();

    assert!(
        wait_for(Duration::from_secs(15), || sink.lock().unwrap().len() == 3),
        "consumer received {} items",
        sink.lock().unwrap().len()
    );
    let got = sink.lock().unwrap().clone();
    assert_eq!(got, vec![
        Bytes::from_static(b"alpha"),
        Bytes::from_static(b"beta"),
        Bytes::from_static(b"gamma"),
    ]);

    // The normal CLOSE stops both services by themselves.
    consumer_ctl.join(Some(10_000)).unwrap();
    consumer_ctl.stop(Some(1_000)).unwrap();
    assert_eq!(consumer_ctl.state.outcome, Outcome::Ok);

    provider_ctl.join(Some(10_000)).unwrap();
    provider_ctl.stop(Some(1_000)).unwrap();
    assert_eq!(provider_ctl.state.outcome, Outcome::Ok);
}

/// S6: the bundle starts components in order and interpolates bound
/// addresses into later sections.
#[test]
fn test_bundle_endpoint_propagation() {
    ferrobus::dev_tracing::init_tracing();
    let ctx = zmq::Context::new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let alpha_uid = uuid!("91c5a1de-2c0f-4db8-8e1f-55aa327b5a03");
    let beta_uid = uuid!("ac2cc7a8-9991-4db0-9f6a-d6be7cf05404");
    let mut registry = ServiceRegistry::new();
    registry
        .register(provider_entry(alpha_uid, "alpha", &[b"one", b"two"]))
        .unwrap();
    registry
        .register(consumer_entry(beta_uid, "beta", sink.clone()))
        .unwrap();

    let config = table(&format!(
        r#"
        [bundle]
        agents = ["alpha", "beta"]

        [alpha]
        agent = "{alpha_uid}"
        pipe = "pipe-6"
        pipe_address = "tcp://127.0.0.1:*"
        pipe_mode = "bind"

        [beta]
        agent = "{beta_uid}"
        pipe = "pipe-6"
        pipe_address = "${{net_address:alpha.pipe}}"
        pipe_mode = "connect"
        pipe_format = "text/plain"
        "#
    ));

    let mut bundle = BundleController::new(ctx);
    bundle.configure(&registry, &config, None).unwrap();
    bundle.start(10_000).unwrap();

    // The provider's wildcard bind landed in the net_address namespace
    let published = bundle
        .addresses()
        .resolve(SECTION_NET_ADDRESS, "alpha.pipe")
        .expect("alpha.pipe published")
        .to_string();
    assert!(published.starts_with("tcp://127.0.0.1:"));
    assert!(!published.ends_with('*'));

    assert!(
        wait_for(Duration::from_secs(15), || sink.lock().unwrap().len() == 2),
        "consumer received {} items",
        sink.lock().unwrap().len()
    );

    bundle.stop(Some(10_000));
    bundle.join(Some(10_000)).unwrap();
    assert_eq!(
        bundle.controller("beta").unwrap().state.outcome,
        Outcome::Ok
    );
}

/// Bundle start failure tears previously started components down.
#[test]
fn test_bundle_start_failure_rolls_back() {
    let ctx = zmq::Context::new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let alpha_uid = uuid!("54b0be77-8e27-4f4b-94b9-2c6aa8d2ff05");
    let beta_uid = uuid!("e7a81a90-9b52-41b6-8a7a-61b2d21e1f06");
    let mut registry = ServiceRegistry::new();
    registry
        .register(provider_entry(alpha_uid, "alpha", &[b"x"]))
        .unwrap();
    registry
        .register(consumer_entry(beta_uid, "beta", sink))
        .unwrap();

    // beta's section is invalid: connect mode without a format
    let config = table(&format!(
        r#"
        [bundle]
        agents = ["alpha", "beta"]

        [alpha]
        agent = "{alpha_uid}"
        pipe = "pipe-r"
        pipe_address = "inproc://rollback-feed"
        pipe_mode = "bind"

        [beta]
        agent = "{beta_uid}"
        pipe = "pipe-r"
        pipe_address = "inproc://rollback-feed"
        pipe_mode = "connect"
        "#
    ));

    let mut bundle = BundleController::new(ctx);
    bundle.configure(&registry, &config, None).unwrap();
    assert!(bundle.start(10_000).is_err());
    // alpha was stopped again during rollback
    assert!(!bundle.controller("alpha").unwrap().is_running());
}

/// Provider → filter → consumer: data crosses two pipes and gets
/// transformed in between; the end-of-stream close cascades through.
#[test]
fn test_filter_pipeline() {
    ferrobus::dev_tracing::init_tracing();
    let ctx = zmq::Context::new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let provider = provider_entry(
        uuid!("0d6ca1c0-5c3d-4a40-b1a7-8a2f9f66aa07"),
        "source",
        &[b"ena", b"dio", b"tria"],
    );
    let filter = filter_entry(uuid!("3e3d3130-1171-4f6e-8a9c-d21cbb7cde08"), "upper");
    let consumer = consumer_entry(
        uuid!("c5b9a2d4-40f5-4a59-8d11-f0e0f7d3ab09"),
        "target",
        sink.clone(),
    );

    let mut provider_ctl = ThreadController::new(ctx.clone(), &provider, None, None);
    provider_ctl
        .configure(table(
            r#"
            pipe = "raw"
            pipe_address = "inproc://filter-in"
            pipe_mode = "bind"
            "#,
        ))
        .unwrap();
    provider_ctl.start(10_000).unwrap();

    let mut filter_ctl = ThreadController::new(ctx.clone(), &filter, None, None);
    filter_ctl
        .configure(table(
            r#"
            input_pipe = "raw"
            input_pipe_address = "inproc://filter-in"
            input_pipe_mode = "connect"
            input_pipe_format = "text/plain"
            output_pipe = "cooked"
            output_pipe_address = "inproc://filter-out"
            output_pipe_mode = "bind"
            output_ready_schedule_interval = 50
            "#,
        ))
        .unwrap();
    filter_ctl.start(10_000).unwrap();

    let mut consumer_ctl = ThreadController::new(ctx, &consumer, None, None);
    consumer_ctl
        .configure(table(
            r#"
            pipe = "cooked"
            pipe_address = "inproc://filter-out"
            pipe_mode = "connect"
            pipe_format = "text/plain"
            "#,
        ))
        .unwrap();
    consumer_ctl.start(10_000).unwrap();

    assert!(
        wait_for(Duration::from_secs(20), || sink.lock().unwrap().len() == 3),
        "consumer received {} items",
        sink.lock().unwrap().len()
    );
    let got = sink.lock().unwrap().clone();
    assert_eq!(got, vec![
        Bytes::from_static(b"ENA"),
        Bytes::from_static(b"DIO"),
        Bytes::from_static(b"TRIA"),
    ]);

    for mut ctl in [consumer_ctl, filter_ctl, provider_ctl] {
        ctl.join(Some(10_000)).unwrap();
        ctl.stop(Some(1_000)).unwrap();
        assert_eq!(ctl.state.outcome, Outcome::Ok, "{} outcome", ctl.state.name);
    }
}
