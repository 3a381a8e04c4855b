//! Owns every forwarder and runs the process-wide shutdown protocol.
//!
//! All forwarders hang off one root [`CancellationToken`] and register
//! their tasks (accept/receive loops and sessions) with one
//! [`TaskTracker`]. Shutdown cancels the root, closes the tracker, and
//! waits on it for at most the configured grace period.

use crate::config::ForwardConfig;
use crate::forwarder::{self, ForwarderHandle};
use crate::rule::AddressRule;
use crate::signal::{wait_for_shutdown_signal, ShutdownSignal};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Result of the (single) shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Every task finished inside the grace period.
    pub drained: bool,
    /// Time spent waiting.
    pub elapsed: Duration,
}

pub struct ForwardingSupervisor {
    rules: Vec<AddressRule>,
    config: ForwardConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
    handles: Vec<ForwarderHandle>,
    started: bool,
    shutdown_requested: AtomicBool,
}

impl ForwardingSupervisor {
    pub fn new(rules: Vec<AddressRule>, config: ForwardConfig) -> Self {
        Self {
            rules,
            config,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            handles: Vec::new(),
            started: false,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn rules(&self) -> &[AddressRule] {
        &self.rules
    }

    /// Forwarders that bound successfully, in rule order.
    pub fn handles(&self) -> &[ForwarderHandle] {
        &self.handles
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Start one forwarder per rule. Returns how many are running.
    ///
    /// A rule whose local socket cannot be bound is reported and skipped;
    /// the others are unaffected. Calling this again is a no-op.
    pub async fn start(&mut self) -> usize {
        if self.started {
            return self.handles.len();
        }
        self.started = true;

        for rule in &self.rules {
            match forwarder::start(*rule, &self.config, &self.tracker, self.cancel.child_token()).await {
                Ok(handle) => self.handles.push(handle),
                Err(e) => error!(rule = %rule, error = %e, "rule aborted"),
            }
        }

        info!(
            running = self.handles.len(),
            configured = self.rules.len(),
            "forwarders started"
        );
        self.handles.len()
    }

    /// Stop all forwarders and wait up to the grace period for sessions.
    ///
    /// Only the first call does anything and returns the outcome; every
    /// later or concurrent call returns `None` immediately. Sessions still
    /// open when the grace period ends are abandoned; their sockets are
    /// released when the process exits.
    pub async fn shutdown(&self) -> Option<DrainOutcome> {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return None;
        }

        let grace = self.config.shutdown_grace;
        info!(grace_ms = grace.as_millis() as u64, "shutting down, draining sessions");

        let started = Instant::now();
        self.cancel.cancel();
        self.tracker.close();

        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        let elapsed = started.elapsed();

        if drained {
            info!(elapsed_ms = elapsed.as_millis() as u64, "all sessions drained");
        } else {
            warn!(remaining = self.tracker.len(), "grace period elapsed, abandoning open sessions");
        }

        Some(DrainOutcome { drained, elapsed })
    }

    /// Start every rule, block until `signal` resolves, then shut down.
    ///
    /// With no rules this still blocks on `signal`.
    pub async fn run<F, S>(mut self, signal: F) -> S
    where
        F: Future<Output = S>,
    {
        self.start().await;
        let received = signal.await;
        self.shutdown().await;
        received
    }

    /// [`run`](Self::run) until SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> ShutdownSignal {
        let signal = wait_for_shutdown_signal();
        self.run(async move {
            let signal = signal.await;
            info!(signal = %signal, "received shutdown signal");
            signal
        })
        .await
    }
}
