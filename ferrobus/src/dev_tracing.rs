//! Development logging helper.

/// Initialize a tracing subscriber when `RUST_LOG` is set.
///
/// Integration tests and embedding binaries call this to get
/// structured logging of channel traffic and component lifecycle
/// events. A no-op when `RUST_LOG` is absent or a global subscriber
/// is already installed, so it is safe to call from every test.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_err() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
