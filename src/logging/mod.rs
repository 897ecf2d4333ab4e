//! Structured logging setup.
//!
//! Components log through `tracing`; this module only owns process-wide
//! initialization and the request-scoped span helper used by the pipeline's
//! `log_request` handler.

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global `tracing` subscriber. Safe to call once at process
/// startup; a second call is a no-op (the error from `set_global_default` is
/// swallowed, matching the common "tests call this repeatedly" pattern).
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Parse a config-file log level string into a `tracing::Level`, defaulting
/// to `INFO` on anything unrecognized.
pub fn level_from_str(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_defaults_to_info() {
        assert_eq!(level_from_str("chatty"), Level::INFO);
    }

    #[test]
    fn recognizes_warn_and_warning() {
        assert_eq!(level_from_str("warn"), Level::WARN);
        assert_eq!(level_from_str("WARNING"), Level::WARN);
    }
}
