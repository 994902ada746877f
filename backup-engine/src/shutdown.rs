//! Signal handling for graceful shutdown.
//!
//! On SIGINT or SIGTERM the shared [`CancellationToken`] is cancelled. Every
//! external command watches that token, so running jobs kill their child
//! processes, remove partial output and record themselves as failed.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Resolve once SIGINT (Ctrl+C) or SIGTERM arrives.
pub async fn wait_for_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            ShutdownSignal::Interrupt
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
            ShutdownSignal::Terminate
        }
    }
}

/// Cancel `token` when a shutdown signal arrives, or stop waiting once it is
/// cancelled some other way.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}
