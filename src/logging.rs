//! Logging setup
//!
//! The library only emits `tracing` events. Applications that want them on
//! stderr call one of these once at startup.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `RUST_LOG` if set, else `blobcache=<level>`
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blobcache={}", level)))
}

/// Install a global subscriber per `config`
///
/// Returns `false` if a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(filter(&config.level));
    let result = match config.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.is_ok()
}

/// Pretty output at `level`
pub fn init_with_level(level: &str) -> bool {
    init(&LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    })
}

/// Verbose output captured by the test harness
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("blobcache=debug"))
        .with_test_writer()
        .try_init();
}
