use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};

/// Wait until the process is asked to stop via SIGTERM, SIGHUP
/// or ctrl-c
pub async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sig_term = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    let mut sig_hup = signal(SignalKind::hangup()).context("listen for SIGHUP")?;

    tokio::select! {
        _ = sig_term.recv() => {
            tracing::info!("SIGTERM received");
        }
        _ = sig_hup.recv() => {
            tracing::info!("SIGHUP received");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            tracing::info!("interrupted");
        }
    };
    Ok(())
}
