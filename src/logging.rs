//! Tracing initialisation: an env-filtered human-readable layer on stdout plus
//! a rolling JSON file sink under `<workspace>/.smithers/logs/`. Spans bracket
//! each RalphLoop iteration and SuperSmithers rewrite attempt and carry
//! `execution_id`/`iteration`/`phase_id` fields so one log stream filters
//! cleanly per execution.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking file writer alive; drop it only on process exit.
pub struct LoggingGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

pub fn init(logs_dir: &Path) -> Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "smithers.log");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().json().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .context("tracing subscriber already initialised")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
