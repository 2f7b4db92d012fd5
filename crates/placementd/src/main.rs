use crate::config::DaemonConfig;
use crate::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use crate::http_server::HttpServer;
use anyhow::Context;
use clap::Parser;
use placement_check::TestManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod diagnostic_logging;
mod http_server;
mod panic;
mod shutdown;

/// How long in-flight requests may take to complete once shutdown
/// has been requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Inbox placement test service.
///
/// Hands out test codes and test inboxes, then reports which folder
/// of each inbox the test message landed in.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load.
    ///
    /// If it does not exist, the built in defaults are used.
    #[arg(long, default_value = "/opt/placementd/placementd.toml")]
    config: PathBuf,

    /// Address to listen on, overriding `listen` in the
    /// configuration file
    #[arg(long)]
    listen: Option<String>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Instead of running the daemon, output the openapi spec json
    /// to stdout
    #[arg(long)]
    dump_openapi_spec: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    if opts.dump_openapi_spec {
        println!("{}", http_server::api_docs().to_pretty_json()?);
        return Ok(());
    }

    panic::register_panic_hook();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let _log_flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "PLACEMENTD_LOG",
        default_filter: "placementd=info,placement_check=info",
    }
    .init()?;

    let mut config = DaemonConfig::load(&opts.config)?;
    if let Some(listen) = opts.listen {
        config.listen = listen;
    }

    let manager = TestManager::new(
        config.manager_config(),
        config.store.build()?,
        Arc::new(config.detector.clone()),
        config.notifier.build()?,
    )?;

    let server = HttpServer {
        listen: config.listen.clone(),
        cors_origins: config.cors_origins()?,
    }
    .start(manager.clone())?;
    tracing::info!(
        "placementd {} ready with {} test inboxes",
        env!("CARGO_PKG_VERSION"),
        manager.test_inboxes().len()
    );

    shutdown::wait_for_shutdown_signal().await?;

    tracing::info!("shutting down");
    manager.shutdown();
    server.shutdown(SHUTDOWN_GRACE).await
}
