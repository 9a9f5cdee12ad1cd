//! # Structured Logging
//!
//! Tracing subscriber setup for hosts embedding the sentinel. The gate
//! itself only emits `tracing` events; this helper wires them to stderr
//! in text or JSON form with env-filter support, and tolerates a
//! subscriber the host already installed.

use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::core::config::LogConfig;
use crate::core::error::SentinelResult;

/// Install a global tracing subscriber per the configured level and
/// format. A subscriber installed earlier (by the host or another
/// test) wins silently.
pub fn init_logging(config: &LogConfig) -> SentinelResult<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    match config.format.to_lowercase().as_str() {
        "json" => {
            let subscriber = Registry::default()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true).with_current_span(true));
            if subscriber.try_init().is_err() {
                warn!("Tracing subscriber already initialized, skipping initialization");
            }
        }
        _ => {
            let subscriber = Registry::default()
                .with(env_filter)
                .with(fmt::layer().with_target(true));
            if subscriber.try_init().is_err() {
                warn!("Tracing subscriber already initialized, skipping initialization");
            }
        }
    }

    info!(level = %level, format = %config.format, "Sentinel logging initialized");
    Ok(())
}
