//! Signal handling.
//!
//! One token is cancelled on SIGINT (Ctrl+C) or SIGTERM. The feed loop and
//! the history scanner check it between units, so a signal that arrives
//! mid-dispatch is not lost.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn the signal listener and return the token it cancels.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl+C received, shutting down...");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down..."),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl+C received, shutting down...");
}
