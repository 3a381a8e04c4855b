//! Engine tunables: idle expiry, sweep cadence, dial bound, shutdown grace.

use std::time::Duration;

/// Default idle time after which a UDP session is dropped.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default period of the UDP idle-session sweep.
pub const DEFAULT_UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Default upper bound on a single outbound TCP connect.
pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time shutdown waits for in-flight sessions to drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Timing configuration shared by every forwarder a supervisor starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    /// A UDP session with no traffic in either direction for this long is removed.
    pub udp_idle_timeout: Duration,
    /// How often the UDP forwarder scans for idle sessions.
    pub udp_sweep_interval: Duration,
    /// Bound on dialing the remote for one accepted TCP connection. Never retried.
    pub tcp_connect_timeout: Duration,
    /// How long shutdown waits for sessions before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            udp_sweep_interval: DEFAULT_UDP_SWEEP_INTERVAL,
            tcp_connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
