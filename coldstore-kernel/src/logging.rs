//! Tracing subscriber for the kernel binary.
//!
//! `RUST_LOG` wins when it parses, e.g. `RUST_LOG=coldstore_kernel=debug,rumqttc=warn`
//! to follow every evaluation cycle. Otherwise kernel events are shown at
//! `info` and dependency chatter (hyper, reqwest, rumqttc) only from `warn`.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "warn,coldstore_kernel=info";

fn env_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

pub fn init() {
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(rust_log.as_deref()))
        .compact()
        .init();
}

#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("coldstore_kernel=debug"))
        .with_test_writer()
        .try_init();
}
