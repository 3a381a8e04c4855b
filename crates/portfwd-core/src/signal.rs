//! Waiting for the process termination signals that start shutdown.

use std::fmt;
use std::future::Future;
use tracing::warn;

/// Which signal ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl ShutdownSignal {
    /// Conventional shell status for death by this signal (128 + signo).
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
///
/// The handlers are registered when this is called, not when the future is
/// first polled, so a signal that arrives while forwarders are still
/// binding is not lost. Once registered they stay in place for the life of
/// the process: later signals no longer kill it outright and are simply
/// absorbed while shutdown runs.
#[cfg(unix)]
pub fn wait_for_shutdown_signal() -> impl Future<Output = ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt());
    let sigterm = signal(SignalKind::terminate());

    async move {
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => ShutdownSignal::Interrupt,
                    _ = sigterm.recv() => ShutdownSignal::Terminate,
                }
            }
            (Ok(mut sigint), Err(e)) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                sigint.recv().await;
                ShutdownSignal::Interrupt
            }
            (Err(e), Ok(mut sigterm)) => {
                warn!(error = %e, "failed to install SIGINT handler");
                sigterm.recv().await;
                ShutdownSignal::Terminate
            }
            (Err(e), Err(_)) => {
                // Nothing to wait for; run until killed rather than
                // shutting down spuriously.
                warn!(error = %e, "failed to install signal handlers");
                std::future::pending().await
            }
        }
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
pub fn wait_for_shutdown_signal() -> impl Future<Output = ShutdownSignal> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        ShutdownSignal::Interrupt
    }
}
