//! Logging init: stderr subscriber with env-filter override.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging to stderr. Respects `RUST_LOG`; defaults to
/// `info` globally and `debug` for this crate. Safe to call more than once —
/// later calls are no-ops (useful in tests that share a process).
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rdm_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
