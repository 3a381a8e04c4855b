//! UDP forwarding with per-client sessions.
//!
//! A single management task owns the session table and multiplexes three
//! events: a datagram on the local socket, the periodic idle sweep, and
//! cancellation. Because only that task ever inserts into the table, a
//! burst of datagrams from a new client can never open two sessions.
//!
//! Each session has its own outbound socket, `connect`ed to the remote, so
//! responses are demultiplexed by the kernel: whatever arrives on a
//! session's socket belongs to that session's client. A companion return
//! task reads from it and writes back through the shared local socket.

use crate::config::ForwardConfig;
use crate::error::{ForwardError, ForwardResult};
use crate::forwarder::{ForwarderHandle, ERROR_BACKOFF};
use crate::gauge::{SessionGauge, SessionGuard};
use crate::rule::{AddressRule, Protocol};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A bound UDP socket for one rule, not yet receiving.
pub struct UdpForwarder {
    rule: AddressRule,
    socket: Arc<UdpSocket>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    sessions: SessionGauge,
}

/// Remote-facing socket of one session. The guard is released together
/// with the socket, so the gauge counts open outbound sockets.
struct Upstream {
    socket: UdpSocket,
    _guard: SessionGuard,
}

/// Last-traffic timestamp shared between the table and the return task.
/// `closed` is set once the return task has given up on the socket.
struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
    closed: AtomicBool,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Table entry for one client address.
struct UdpSession {
    upstream: Arc<Upstream>,
    activity: Arc<Activity>,
    cancel: CancellationToken,
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        // Ends the return task, which holds the other reference to the socket.
        self.cancel.cancel();
    }
}

impl UdpForwarder {
    /// Bind the rule's local endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Bind`] if the socket cannot be bound.
    pub async fn bind(rule: AddressRule, config: &ForwardConfig) -> ForwardResult<Self> {
        let socket = UdpSocket::bind(rule.local())
            .await
            .map_err(|source| ForwardError::Bind {
                protocol: Protocol::Udp,
                addr: rule.local(),
                source,
            })?;

        Ok(Self {
            rule,
            socket: Arc::new(socket),
            idle_timeout: config.udp_idle_timeout,
            sweep_interval: sweep_period(config),
            sessions: SessionGauge::new(),
        })
    }

    /// Bind and spawn the management task on `tracker`.
    pub async fn start(
        rule: AddressRule,
        config: &ForwardConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> ForwardResult<ForwarderHandle> {
        let forwarder = Self::bind(rule, config).await?;
        let local_addr = forwarder.socket.local_addr()?;
        let sessions = forwarder.sessions.clone();

        info!(
            rule = %rule,
            local = %local_addr,
            idle_timeout_ms = config.udp_idle_timeout.as_millis() as u64,
            "UDP forwarder listening"
        );

        let task = tracker.spawn(forwarder.run(cancel.clone(), tracker.clone()));
        Ok(ForwarderHandle::new(rule, local_addr, cancel, sessions, task))
    }

    async fn run(self, cancel: CancellationToken, tracker: TaskTracker) {
        let mut table: HashMap<SocketAddr, UdpSession> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(rule = %self.rule, "receive loop cancelled");
                    break;
                }
                _ = sweep.tick() => {
                    self.sweep(&mut table);
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, client)) => {
                            self.forward(&mut table, client, &buf[..n], &cancel, &tracker).await;
                        }
                        Err(e) => {
                            warn!(rule = %self.rule, error = %e, "UDP receive failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        let closed = table.len();
        table.clear();
        info!(rule = %self.rule, closed, "UDP forwarder stopped");
    }

    /// Relay one inbound datagram, opening a session for a new client.
    async fn forward(
        &self,
        table: &mut HashMap<SocketAddr, UdpSession>,
        client: SocketAddr,
        payload: &[u8],
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        // A session whose return path died can no longer deliver replies.
        if table.get(&client).is_some_and(|s| s.activity.is_closed()) {
            table.remove(&client);
            debug!(client = %client, "reopening UDP session after return path failure");
        }

        let session = match table.entry(client) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.open_session(client, cancel, tracker).await {
                Ok(session) => entry.insert(session),
                Err(e) => {
                    warn!(client = %client, error = %e, "failed to open UDP session, datagram dropped");
                    return;
                }
            },
        };

        session.activity.touch();
        // Zero-length payloads are forwarded like any other datagram.
        if let Err(e) = session.upstream.socket.send(payload).await {
            debug!(client = %client, error = %e, "UDP send to remote failed");
        }
    }

    async fn open_session(
        &self,
        client: SocketAddr,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> ForwardResult<UdpSession> {
        let remote = self.rule.remote();
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;

        let upstream = Arc::new(Upstream {
            socket,
            _guard: self.sessions.acquire(),
        });
        let activity = Arc::new(Activity::new());
        let session_cancel = cancel.child_token();

        tracker.spawn(return_path(
            upstream.clone(),
            self.socket.clone(),
            client,
            activity.clone(),
            session_cancel.clone(),
        ));

        debug!(client = %client, remote = %remote, active = self.sessions.active(), "UDP session opened");

        Ok(UdpSession {
            upstream,
            activity,
            cancel: session_cancel,
        })
    }

    /// Drop every session idle longer than the timeout, and any whose
    /// return path has closed.
    fn sweep(&self, table: &mut HashMap<SocketAddr, UdpSession>) {
        let before = table.len();

        table.retain(|client, session| {
            if session.activity.is_closed() {
                debug!(client = %client, "UDP session dropped, return path closed");
                return false;
            }
            let idle = session.activity.idle();
            if idle > self.idle_timeout {
                debug!(client = %client, idle_ms = idle.as_millis() as u64, "UDP session expired");
                return false;
            }
            true
        });

        let removed = before - table.len();
        if removed > 0 {
            debug!(rule = %self.rule, removed, remaining = table.len(), "UDP sweep removed idle sessions");
        }
    }
}

/// Sweep period for `config`: never zero, never longer than the idle timeout.
fn sweep_period(config: &ForwardConfig) -> Duration {
    config
        .udp_sweep_interval
        .min(config.udp_idle_timeout)
        .max(MIN_SWEEP_INTERVAL)
}

/// Relay responses from the remote back to `client` until cancelled.
async fn return_path(
    upstream: Arc<Upstream>,
    local: Arc<UdpSocket>,
    client: SocketAddr,
    activity: Arc<Activity>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = upstream.socket.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        activity.touch();
                        if let Err(e) = local.send_to(&buf[..n], client).await {
                            debug!(client = %client, error = %e, "UDP send to client failed");
                        }
                    }
                    // ICMP port unreachable from an earlier send; the remote may come back.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        debug!(client = %client, "remote refused UDP datagram");
                    }
                    Err(e) => {
                        warn!(client = %client, error = %e, "UDP return path failed");
                        activity.close();
                        break;
                    }
                }
            }
        }
    }

    debug!(client = %client, "UDP return path closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn spawn_echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn start_forwarder(remote: SocketAddr, config: &ForwardConfig, tracker: &TaskTracker) -> ForwarderHandle {
        let rule = AddressRule::new(Protocol::Udp, "127.0.0.1:1".parse().unwrap(), remote)
            .unwrap()
            .with_local("127.0.0.1:0".parse().unwrap());
        UdpForwarder::start(rule, config, tracker, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, _) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("no datagram received")
            .unwrap();
        buf.truncate(n);
        buf
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_echo() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;

        let c = client().await;
        c.send_to(b"ping", handle.local_addr()).await.unwrap();
        assert_eq!(recv(&c).await, b"ping");
        assert_eq!(handle.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_zero_length_datagram_forwarded() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;

        let c = client().await;
        c.send_to(&[], handle.local_addr()).await.unwrap();
        assert!(recv(&c).await.is_empty());

        // Session survives; an empty datagram is not a teardown signal.
        c.send_to(b"still here", handle.local_addr()).await.unwrap();
        assert_eq!(recv(&c).await, b"still here");
        assert_eq!(handle.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_two_clients_no_cross_delivery() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;
        let addr = handle.local_addr();

        let a = client().await;
        let b = client().await;
        for i in 0..10 {
            a.send_to(format!("alpha-{i}").as_bytes(), addr).await.unwrap();
            b.send_to(format!("bravo-{i}").as_bytes(), addr).await.unwrap();
        }

        for _ in 0..10 {
            let got = recv(&a).await;
            assert!(got.starts_with(b"alpha-"), "client a got {:?}", String::from_utf8_lossy(&got));
            let got = recv(&b).await;
            assert!(got.starts_with(b"bravo-"), "client b got {:?}", String::from_utf8_lossy(&got));
        }
        assert_eq!(handle.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_burst_opens_one_session() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;

        let c = client().await;
        for i in 0..50u8 {
            c.send_to(&[i], handle.local_addr()).await.unwrap();
        }
        recv(&c).await;
        assert_eq!(handle.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let config = ForwardConfig {
            udp_idle_timeout: Duration::from_millis(200),
            udp_sweep_interval: Duration::from_millis(50),
            ..ForwardConfig::default()
        };
        let handle = start_forwarder(echo, &config, &tracker).await;

        let c = client().await;
        c.send_to(b"once", handle.local_addr()).await.unwrap();
        assert_eq!(recv(&c).await, b"once");
        assert_eq!(handle.active_sessions(), 1);

        wait_until(|| handle.active_sessions() == 0).await;

        // A returning client simply gets a fresh session.
        c.send_to(b"again", handle.local_addr()).await.unwrap();
        assert_eq!(recv(&c).await, b"again");
        assert_eq!(handle.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;

        let c = client().await;
        c.send_to(b"hi", handle.local_addr()).await.unwrap();
        recv(&c).await;

        let sessions = handle.sessions();
        handle.stop();
        handle.join().await;
        wait_until(|| sessions.active() == 0).await;
    }

    #[tokio::test]
    async fn test_no_reply_after_stop() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let handle = start_forwarder(echo, &ForwardConfig::default(), &tracker).await;
        let addr = handle.local_addr();

        let c = client().await;
        c.send_to(b"before", addr).await.unwrap();
        assert_eq!(recv(&c).await, b"before");

        handle.stop();
        handle.join().await;

        // The port may be unreachable now; either way nothing comes back.
        let _ = c.send_to(b"after", addr).await;
        let mut buf = [0u8; 64];
        let reply = tokio::time::timeout(Duration::from_millis(300), c.recv_from(&mut buf)).await;
        assert!(!matches!(reply, Ok(Ok(_))), "datagram forwarded after stop");
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_is_clamped() {
        let tracker = TaskTracker::new();
        let echo = spawn_echo_server().await;
        let config = ForwardConfig {
            udp_idle_timeout: Duration::from_millis(100),
            udp_sweep_interval: Duration::ZERO,
            ..ForwardConfig::default()
        };
        let handle = start_forwarder(echo, &config, &tracker).await;

        let c = client().await;
        c.send_to(b"tick", handle.local_addr()).await.unwrap();
        assert_eq!(recv(&c).await, b"tick");
        wait_until(|| handle.active_sessions() == 0).await;
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_sweep_period_bounds() {
        let period = |idle_ms, sweep_ms| {
            sweep_period(&ForwardConfig {
                udp_idle_timeout: Duration::from_millis(idle_ms),
                udp_sweep_interval: Duration::from_millis(sweep_ms),
                ..ForwardConfig::default()
            })
        };
        assert_eq!(period(30_000, 5_000), Duration::from_secs(5));
        assert_eq!(period(200, 5_000), Duration::from_millis(200));
        assert_eq!(period(30_000, 0), MIN_SWEEP_INTERVAL);
        assert_eq!(period(0, 0), MIN_SWEEP_INTERVAL);
    }

    async fn bind_forwarder(remote: SocketAddr) -> UdpForwarder {
        let rule = AddressRule::new(Protocol::Udp, "127.0.0.1:1".parse().unwrap(), remote)
            .unwrap()
            .with_local("127.0.0.1:0".parse().unwrap());
        UdpForwarder::bind(rule, &ForwardConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_sweep_drops_closed_session() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let echo = spawn_echo_server().await;
        let forwarder = bind_forwarder(echo).await;
        let client_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let mut table = HashMap::new();
        forwarder.forward(&mut table, client_addr, b"x", &cancel, &tracker).await;
        assert_eq!(forwarder.sessions.active(), 1);

        // Recently touched, so only the closed flag can remove it.
        table[&client_addr].activity.close();
        forwarder.sweep(&mut table);
        assert!(table.is_empty());
        wait_until(|| forwarder.sessions.active() == 0).await;
    }

    #[tokio::test]
    async fn test_closed_session_reopens_on_next_datagram() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let echo = spawn_echo_server().await;
        let forwarder = bind_forwarder(echo).await;
        let c = client().await;
        let client_addr = c.local_addr().unwrap();

        let mut table = HashMap::new();
        forwarder.forward(&mut table, client_addr, b"first", &cancel, &tracker).await;
        let stale = table[&client_addr].activity.clone();
        stale.close();

        forwarder.forward(&mut table, client_addr, b"second", &cancel, &tracker).await;
        let fresh = &table[&client_addr].activity;
        assert!(!Arc::ptr_eq(&stale, fresh));
        assert!(!fresh.is_closed());

        // The replacement session relays replies; the closed one's were lost.
        let mut got = Vec::new();
        while got != b"second" {
            got = recv(&c).await;
        }
        wait_until(|| forwarder.sessions.active() == 1).await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rule = AddressRule::new(Protocol::Udp, "127.0.0.1:1".parse().unwrap(), "127.0.0.1:9".parse().unwrap())
            .unwrap()
            .with_local(taken.local_addr().unwrap());

        match UdpForwarder::bind(rule, &ForwardConfig::default()).await {
            Err(ForwardError::Bind { protocol, .. }) => assert_eq!(protocol, Protocol::Udp),
            Err(other) => panic!("expected bind error, got {other}"),
            Ok(_) => panic!("expected bind error"),
        }
    }

    #[test]
    fn test_activity_idle_resets_on_touch() {
        let activity = Activity::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(activity.idle() >= Duration::from_millis(20));
        activity.touch();
        assert!(activity.idle() < Duration::from_millis(20));
    }

    #[test]
    fn test_activity_close() {
        let activity = Activity::new();
        assert!(!activity.is_closed());
        activity.close();
        activity.touch();
        assert!(activity.is_closed());
    }
}
