//! Tracing setup.
//!
//! Workers, the monitor and network threads are named, so every line carries
//! the thread it was logged from. `RUST_LOG` directives are honoured on top
//! of the configured level.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{CoreError, Result};

pub(crate) fn parse_level(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn filter(level: &str) -> EnvFilter {
    let directive: Directive = parse_level(level).into();
    EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy()
}

/// Install the global subscriber: stdout, plus a plain-text copy in
/// `config.file` unless it is empty.
///
/// Fails if the log file cannot be created or a subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let file_layer = if config.file.is_empty() {
        None
    } else {
        let path = Path::new(&config.file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = Arc::new(File::create(path)?);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_thread_names(true),
        )
    };

    tracing_subscriber::registry()
        .with(filter(&config.level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_names(true),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| CoreError::Config(format!("failed to install logger: {}", e)))
}

/// Console logging only. Does nothing if a subscriber is already installed.
pub fn init_console_only(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_names(true),
        )
        .try_init();
}
