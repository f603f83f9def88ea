use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, warn};

// Functions

pub async fn wait_for_sigint_or_sigterm() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    select! {
        _ = sigint.recv() => {
            debug!("sigint received");
        },
        _ = sigterm.recv() => {
            debug!("sigterm received");
        },
    }
    Ok(())
}

/// Resolves once the process is asked to stop. Suitable for graceful shutdown of servers.
pub async fn shutdown_signal() {
    if let Err(err) = wait_for_sigint_or_sigterm().await {
        warn!("failed to listen for signals, stopping now: {err}");
    }
}
