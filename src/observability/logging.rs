//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` directives take
//! precedence over the configured level.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(format: &str) -> Self {
        if format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the subscriber; a second call keeps the first subscriber
pub fn init_logging(config: &LoggingConfig) {
    let level = parse_level(&config.level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let installed = match LogFormat::parse(&config.format) {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    match installed {
        Ok(()) => info!(level = %level, format = %config.format, "Logging initialized"),
        Err(_) => warn!("Tracing subscriber already initialized, keeping it"),
    }
}
