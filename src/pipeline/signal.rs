use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::cancel::{CancelToken, StopReason};

/// Cancel `token` on SIGINT / SIGTERM. The listener exits on its own once the
/// token is cancelled by anyone else.
pub fn listen_for_interrupt(token: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = interrupt() => {
                info!("Shutting down...");
                token.cancel_with(StopReason::Interrupted);
            }
        }
    })
}

#[cfg(unix)]
async fn interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {err}");
            return ctrl_c().await;
        }
    };
    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn interrupt() {
    ctrl_c().await
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {err}");
        // Without a handler only programmatic cancellation can stop the pipeline.
        std::future::pending::<()>().await;
    }
}
