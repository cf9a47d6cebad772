//! Logging
//!
//! Everything goes to a rolling file through a non-blocking writer. Text mode
//! also mirrors to stderr; stdout belongs to the event stream.
//!
//! Two targets get special treatment:
//! - `FAULT`: jam, discrepancy and configuration faults, kept at `warn` or
//!   louder whatever the configured level
//! - `EVENT`: one line per published transport event, off unless
//!   `enable_tracing` is set

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{AppConfig, LogRotation};

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Filter used when `RUST_LOG` is not set
pub fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone(), "FAULT=warn".to_string()];
    if !config.enable_tracing {
        directives.push("EVENT=off".to_string());
    }
    directives.join(",")
}

/// Install the global subscriber. Hold the guard until shutdown or buffered
/// lines are lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender =
        RollingFileAppender::new(config.rotation.into(), &config.log_dir, &config.log_file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let json_file = config
        .use_json
        .then(|| fmt::layer().json().with_writer(writer.clone()).with_ansi(false));
    let text_file = (!config.use_json)
        .then(|| fmt::layer().with_writer(writer.clone()).with_ansi(false));
    let console = (!config.use_json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_file)
        .with(text_file)
        .with(console)
        .init();

    guard
}
