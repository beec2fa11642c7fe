//! Subscriber setup for the CLI tools

use rist::LogLevel;
use tracing_subscriber::EnvFilter;

/// Resolve `--verbose-level` into a RIST log level
///
/// Unknown numbers fall back to the default level.
pub fn log_level(verbose: Option<i32>) -> LogLevel {
    verbose.and_then(LogLevel::from_i32).unwrap_or_default()
}

/// Install the global `fmt` subscriber, logging to stderr
///
/// `RUST_LOG` wins over the verbose level when set.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}
