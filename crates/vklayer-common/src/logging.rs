use tracing_subscriber::{fmt, EnvFilter};

/// Env var consulted for the log filter.
pub const LOG_ENV: &str = "VKLAYER_LOG";

/// Initialize structured logging with environment filter.
/// Set VKLAYER_LOG=debug (or trace, info, warn, error) for verbosity control.
///
/// The layer can be loaded into a process that already installed a
/// subscriber, so a second call is ignored instead of panicking.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
