//! Protocol-independent handle to a running forwarder.
//!
//! Both [`TcpForwarder`](crate::TcpForwarder) and
//! [`UdpForwarder`](crate::UdpForwarder) hand back a [`ForwarderHandle`]
//! once their local socket is bound. The handle owns the forwarder's
//! cancellation token and its accept/receive task.

use crate::config::ForwardConfig;
use crate::error::ForwardResult;
use crate::gauge::SessionGauge;
use crate::rule::{AddressRule, Protocol};
use crate::tcp::TcpForwarder;
use crate::udp::UdpForwarder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Pause after a transient accept/receive error so a persistent failure
/// (e.g. descriptor exhaustion) does not spin.
pub(crate) const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Start the forwarder matching `rule.protocol()`.
///
/// Binds the local socket before returning, so a [`ForwardError::Bind`]
/// surfaces here and only affects this rule. Every task the forwarder
/// spawns is registered with `tracker`.
///
/// [`ForwardError::Bind`]: crate::ForwardError::Bind
pub async fn start(
    rule: AddressRule,
    config: &ForwardConfig,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> ForwardResult<ForwarderHandle> {
    match rule.protocol() {
        Protocol::Tcp => TcpForwarder::start(rule, config, tracker, cancel).await,
        Protocol::Udp => UdpForwarder::start(rule, config, tracker, cancel).await,
    }
}

/// A running forwarder for one rule.
#[derive(Debug)]
pub struct ForwarderHandle {
    rule: AddressRule,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    sessions: SessionGauge,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    pub(crate) fn new(
        rule: AddressRule,
        local_addr: SocketAddr,
        cancel: CancellationToken,
        sessions: SessionGauge,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            rule,
            local_addr,
            cancel,
            sessions,
            task,
        }
    }

    pub fn rule(&self) -> &AddressRule {
        &self.rule
    }

    /// Address the local socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions whose sockets are still open.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    /// Shared session counter; stays valid after the handle is joined.
    pub fn sessions(&self) -> SessionGauge {
        self.sessions.clone()
    }

    /// Stop accepting new work.
    ///
    /// The accept/receive loop wakes immediately and drops its local
    /// socket. TCP sessions already established keep running until they
    /// end on their own; UDP sessions are closed. Calling this more than
    /// once is harmless.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the accept/receive loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the accept/receive loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(rule = %self.rule, error = %e, "forwarder task failed");
        }
    }
}
