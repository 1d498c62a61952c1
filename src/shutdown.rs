use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Resolve once the process receives SIGTERM or SIGINT.
pub async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, stopping scheduler");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, stopping scheduler");
        }
    }
    Ok(())
}

/// Spawn a listener for SIGTERM/SIGINT.
///
/// The returned token is cancelled when either signal arrives, or right away
/// if the signal handlers cannot be installed.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
        token_clone.cancel();
    });

    token
}
