//! Graceful shutdown.
//!
//! `shutdown_signal` waits for either `Ctrl+C` or a `SIGTERM` on Unix. The
//! binary races it against a running batch and cancels the batch token when
//! it fires, so completed results are still written out.
//!
//! ```no_run
//! # async fn example() {
//! use genpool::shutdown_signal;
//! shutdown_signal().await;
//! # }
//! ```

use tracing::{debug, warn};

/// Waits for either `Ctrl+C` or `SIGTERM` (on Unix) to be received.
pub async fn shutdown_signal() {
    debug!("awaiting shutdown signal");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    debug!("shutdown signal received");
}
