//! Telemetry helpers for structured logging.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries and tests that have no subscriber of
/// their own. Respects `RUST_LOG`; defaults to `info` for this crate when
/// the variable is unset. A subscriber installed by the host service wins.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("omnishot_dispatch=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
