// ABOUTME: Optional process-wide tracing subscriber for binaries embedding the executor
// ABOUTME: RUST_LOG driven filter with a caller-provided fallback directive

use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
