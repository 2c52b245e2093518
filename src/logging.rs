//! Tracing setup: console output, optional rotating file log, and a reload
//! handle so `POST /log-level` can adjust verbosity at runtime.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Handle for runtime log-level changes.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    pub fn set_level(&self, level: &str) -> Result<(), String> {
        if !VALID_LEVELS.contains(&level) {
            return Err(format!("unknown log level '{level}'"));
        }
        self.handle
            .reload(EnvFilter::new(level))
            .map_err(|e| format!("failed to apply log level: {e}"))
    }
}

/// Initialize the global subscriber.  When `log_dir` is given, a `server.log`
/// file layer is added alongside the console layer; the returned guard must
/// be held for the process lifetime so buffered lines are flushed.
pub fn init(
    level: &str,
    log_dir: Option<&Path>,
) -> Result<(LogControl, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    let filter = EnvFilter::new(level);
    let (filter, handle) = reload::Layer::new(filter);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok((LogControl { handle }, guard))
}
