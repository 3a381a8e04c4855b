//! TCP forwarding: accept loop plus one relay task per connection.
//!
//! Each accepted client gets a single outbound dial to the rule's remote
//! (bounded by the connect timeout, never retried). Once both sides are
//! up, the two copy directions run concurrently; as soon as either one
//! reaches EOF or fails, both streams are shut down and dropped so no
//! half-open pair is left behind.

use crate::config::ForwardConfig;
use crate::error::{ForwardError, ForwardResult};
use crate::forwarder::{ForwarderHandle, ERROR_BACKOFF};
use crate::gauge::SessionGauge;
use crate::rule::{AddressRule, Protocol};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A bound TCP listener for one rule, not yet accepting.
pub struct TcpForwarder {
    rule: AddressRule,
    listener: TcpListener,
    connect_timeout: Duration,
    sessions: SessionGauge,
}

impl TcpForwarder {
    /// Bind the rule's local endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Bind`] if the listener cannot be created
    /// (port in use, permission denied, address not local).
    pub async fn bind(rule: AddressRule, config: &ForwardConfig) -> ForwardResult<Self> {
        let listener = TcpListener::bind(rule.local())
            .await
            .map_err(|source| ForwardError::Bind {
                protocol: Protocol::Tcp,
                addr: rule.local(),
                source,
            })?;

        Ok(Self {
            rule,
            listener,
            connect_timeout: config.tcp_connect_timeout,
            sessions: SessionGauge::new(),
        })
    }

    /// Bind and spawn the accept loop on `tracker`.
    pub async fn start(
        rule: AddressRule,
        config: &ForwardConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> ForwardResult<ForwarderHandle> {
        let forwarder = Self::bind(rule, config).await?;
        let local_addr = forwarder.listener.local_addr()?;
        let sessions = forwarder.sessions.clone();

        info!(rule = %rule, local = %local_addr, "TCP forwarder listening");

        let task = tracker.spawn(forwarder.accept_loop(cancel.clone(), tracker.clone()));
        Ok(ForwarderHandle::new(rule, local_addr, cancel, sessions, task))
    }

    /// Accept until cancelled or the listener becomes unusable.
    ///
    /// Returning drops the listener, which closes the listening socket.
    async fn accept_loop(self, cancel: CancellationToken, tracker: TaskTracker) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(rule = %self.rule, "accept loop cancelled");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((client, peer)) => {
                            let guard = self.sessions.acquire();
                            let remote = self.rule.remote();
                            let connect_timeout = self.connect_timeout;
                            tracker.spawn(async move {
                                let _guard = guard; // counted until both streams close
                                match relay_connection(client, peer, remote, connect_timeout).await {
                                    Ok(()) => debug!(peer = %peer, "TCP session ended"),
                                    Err(e @ (ForwardError::Dial { .. } | ForwardError::DialTimeout { .. })) => {
                                        warn!(peer = %peer, error = %e, "dropping client, remote unreachable");
                                    }
                                    Err(e) => debug!(peer = %peer, error = %e, "TCP session ended with error"),
                                }
                            });
                        }
                        Err(e) if is_fatal_accept_error(&e) => {
                            error!(rule = %self.rule, error = %e, "listener failed, stopping rule");
                            break;
                        }
                        Err(e) => {
                            warn!(rule = %self.rule, error = %e, "accept failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!(rule = %self.rule, active = self.sessions.active(), "TCP forwarder stopped accepting");
    }
}

/// Errors that mean the listening socket itself is gone, as opposed to a
/// single failed handshake or temporary resource exhaustion.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

async fn dial(remote: SocketAddr, connect_timeout: Duration) -> ForwardResult<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(remote)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ForwardError::Dial {
            addr: remote,
            source,
        }),
        Err(_) => Err(ForwardError::DialTimeout { addr: remote }),
    }
}

/// One TCP session: dial, relay, then close both sides.
///
/// On a dial failure the client stream is dropped here, which closes it.
async fn relay_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    remote: SocketAddr,
    connect_timeout: Duration,
) -> ForwardResult<()> {
    let mut upstream = dial(remote, connect_timeout).await?;
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    debug!(peer = %peer, remote = %remote, "TCP session established");

    let result = relay(&mut client, &mut upstream).await;

    // Either side may already be closed; shutdown errors are irrelevant.
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    let (direction, bytes) = result?;
    debug!(peer = %peer, direction, bytes, "TCP copy finished");
    Ok(())
}

/// Copy both directions until the first one finishes.
///
/// Returns which direction finished first and how many bytes it moved.
async fn relay(client: &mut TcpStream, upstream: &mut TcpStream) -> io::Result<(&'static str, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            result.map(|n| ("client->remote", n))
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            result.map(|n| ("remote->client", n))
        }
    }
}
