// Cooperative shutdown for supervised processes.
//
// The launcher's graceful termination signal is SIGTERM; server and
// client processes watch for it and wind down within the grace period
// instead of being force-killed.

use tokio::sync::watch;

/// Wait for a termination request (SIGTERM or Ctrl+C on Unix, Ctrl+C
/// elsewhere).
pub async fn wait_for_terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received Ctrl+C, shutting down");
    }
}

/// Spawn the signal watcher and return a receiver that flips to true
/// when termination is requested. Select on `.changed()` at any
/// suspension point that should be abandonable.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_terminate().await;
        let _ = tx.send(true);
    });
    rx
}
