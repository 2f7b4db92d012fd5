use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// The reload handle has a type that depends on how the layers are
// composed, and some of those layers are `impl Layer`, so it cannot be
// named here. Stash a closure that captures the handle instead.
static FILTER_RELOAD: OnceLock<Box<dyn Fn(EnvFilter) -> anyhow::Result<()> + Send + Sync>> =
    OnceLock::new();

/// Replace the active diagnostic filter
pub fn set_diagnostic_log_filter(new_filter: EnvFilter) -> anyhow::Result<()> {
    let func = FILTER_RELOAD
        .get()
        .ok_or_else(|| anyhow::anyhow!("diagnostic logging has not been initialized"))?;
    (func)(new_filter)
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig<'_> {
    /// Install the global subscriber.
    /// When logging to files, the returned guard must be kept alive
    /// for as long as the process wants its logs flushed.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let mut guard = None;
        let log_writer = match &self.log_dir {
            Some(log_dir) => {
                let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
                let (non_blocking, flusher) = tracing_appender::non_blocking(file_appender);
                guard.replace(flusher);
                BoxMakeWriter::new(non_blocking)
            }
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let filter = std::env::var(self.filter_env_var);
        let filter = filter.as_deref().unwrap_or(self.default_filter);
        let env_filter = EnvFilter::try_new(filter)
            .with_context(|| format!("parsing log filter '{filter}'"))?;
        let (env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init()
            .context("installing diagnostic log subscriber")?;

        FILTER_RELOAD
            .set(Box::new(move |new_filter: EnvFilter| {
                reload_handle
                    .reload(new_filter)
                    .context("applying new log filter")
            }))
            .map_err(|_| anyhow::anyhow!("failed to assign reloadable logging filter"))?;

        Ok(guard)
    }
}
