//! Process shutdown signal
//!
//! Bridges SIGINT/SIGTERM into the cancellation-token tree the services
//! hand their tasks: a service takes one root token at startup and
//! derives child tokens from it, so the signal reaches every loop as a
//! cancellation.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Root token for a service's shutdown tree
///
/// Cancelled when the process receives Ctrl+C (SIGINT) or, on unix,
/// SIGTERM. The caller decides what cancellation means per task by
/// deriving child tokens.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("No SIGTERM handler ({}), stopping on Ctrl+C only", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        },
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
