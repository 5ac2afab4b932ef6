//! Process-wide tracing setup, `RUST_LOG`-driven.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber. Call once at process start.
/// Safe to call more than once in tests; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("factory_core=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
