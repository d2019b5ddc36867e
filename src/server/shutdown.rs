//! Graceful shutdown coordination
//!
//! Listens for SIGTERM/SIGINT and broadcasts a shutdown signal to the
//! components that need to stop accepting work.

use tokio::sync::watch;
use tracing::info;

/// Receiver half of the shutdown broadcast
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown is triggered
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Non-blocking check
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sender half, held by main
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
        info!("Shutdown signal sent");
    }
}

/// Create a (controller, signal) pair; the signal is cloned into components
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Block until SIGTERM or SIGINT arrives, returning the signal name
///
/// # Panics
/// Panics if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            panic!("Cannot register SIGTERM handler: {}", e);
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGINT handler");
            panic!("Cannot register SIGINT handler: {}", e);
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            "SIGTERM"
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
            "SIGINT"
        }
    }
}

/// Ctrl+C fallback for non-Unix platforms
///
/// # Panics
/// Panics if the Ctrl+C handler cannot be registered.
#[cfg(not(unix))]
#[allow(clippy::expect_used)]
pub async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("Cannot register Ctrl+C handler");
    info!("Received Ctrl+C");
    "SIGINT"
}
