//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT or SIGTERM on Unix).
///
/// If a handler cannot be installed the failure is logged and only the
/// remaining signals are awaited.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())
        .inspect_err(|e| warn!("Failed to set up SIGINT handler: {e}"))
        .ok();
    let mut sigterm = signal(SignalKind::terminate())
        .inspect_err(|e| warn!("Failed to set up SIGTERM handler: {e}"))
        .ok();

    let interrupt = async {
        match sigint.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending().await,
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = interrupt => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = terminate => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(message = "Signal received.", signal = "CTRL_C");
    }
}

/// Cancel `token` once a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}
