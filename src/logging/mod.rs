//! Structured logging setup: an env-filter plus a timer/ansi-toggling `fmt`
//! layer, with a single output format this crate ships.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt::time::UtcTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub mod audit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub enable_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_colors: true,
        }
    }
}

/// Initialize the global tracing subscriber. Idempotent-ish: a second call
/// in the same process will panic, so callers (the binary's `main`, tests
/// via `try_init`) only call it once.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_ansi(config.enable_colors)
            .with_timer(UtcTime::rfc_3339()),
    );
    subscriber.init();
}
