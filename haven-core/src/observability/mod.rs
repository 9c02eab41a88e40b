//! Observability infrastructure: tracing subscriber setup.
//!
//! Metrics are emitted through the `metrics` facade everywhere; they are
//! no-ops until an embedding application installs a recorder.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `HAVEN_LOG`, then `RUST_LOG`, then `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    for var in ["HAVEN_LOG", "RUST_LOG"] {
        if let Ok(directives) = std::env::var(var) {
            if let Ok(filter) = EnvFilter::try_new(&directives) {
                return filter;
            }
        }
    }
    EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Call once at startup. Fails if a global subscriber is already set.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .try_init()?;

    tracing::debug!("Observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_default_falls_back() {
        // Only meaningful when neither variable is set in the test environment
        if std::env::var("HAVEN_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            assert_eq!(env_filter("debug").to_string(), "debug");
            assert_eq!(env_filter("not a [level").to_string(), "warn");
        }
    }
}
