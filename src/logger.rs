use std::{fs, path::Path};

use anyhow::{Context as _, Result};
use extension_sdk::message::LogLevel;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

pub const LOG_FILE: &str = "extension_host.log";
pub const EVENT_FILE: &str = "extension_host.events.json";

/// Installs the global subscriber.
///
/// Logs go to stderr, never stdout: stdout carries frames. With a `log_dir`
/// there is also a daily plain-text log and a daily newline-delimited JSON
/// event log. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: LogLevel, log_dir: Option<&Path>) -> Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true).with_filter(filter());

    let file_layers = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false).with_filter(filter());

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(filter());

            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    Registry::default()
        .with(stderr_layer)
        .with(file_layers)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
