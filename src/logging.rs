use crate::config::Settings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Logging setup.
/// RUST_LOG wins over `logging.level`; `logging.json` switches the format.
pub fn init(settings: &Settings) {
    let level = settings
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = if settings.logging.json.unwrap_or(false) {
        fmt::layer().json().with_current_span(false).boxed()
    } else {
        fmt::layer().boxed()
    };

    // a second init (e.g. in tests) is not an error
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
