//! Tracing setup shared by every binary

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber, logging to stderr.
///
/// `RUST_LOG` wins over `default_level` unless `debug` is set.
pub fn init(debug: bool, format: LogFormat, default_level: &str) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
