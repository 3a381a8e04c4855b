//! portfwd-core: the forwarding engine behind `portfwd`.
//!
//! Turns validated [`AddressRule`]s into running TCP and UDP forwarders,
//! relays bytes between local clients and remote endpoints, and
//! coordinates a bounded, idempotent shutdown across every rule.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod gauge;
pub mod rule;
pub mod signal;
pub mod supervisor;
pub mod tcp;
pub mod udp;

// Re-export commonly used items at crate root.
pub use config::ForwardConfig;
pub use error::{ForwardError, ForwardResult};
pub use forwarder::ForwarderHandle;
pub use gauge::{SessionGauge, SessionGuard};
pub use rule::{AddressRule, Protocol};
pub use signal::{wait_for_shutdown_signal, ShutdownSignal};
pub use supervisor::{DrainOutcome, ForwardingSupervisor};
pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;
