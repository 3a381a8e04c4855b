//! Forwarding rules and the `localPort:remoteAddress:remotePort` grammar.
//!
//! Parsing is all-or-nothing: either every field validates and an
//! [`AddressRule`] is produced, or a [`ForwardError::Config`] names the raw
//! input and the first problem found. No DNS resolution is attempted; the
//! remote address must be an IP literal. IPv6 literals are written in
//! brackets, e.g. `8080:[::1]:80`.

use crate::error::{ForwardError, ForwardResult};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Transport protocol a rule forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(ForwardError::config(s, "protocol must be \"tcp\" or \"udp\""))
        }
    }
}

/// One validated local-to-remote forwarding instruction.
///
/// Fields are private so a rule cannot change after construction. Both
/// ports are always in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRule {
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
}

impl AddressRule {
    /// Build a rule from already-resolved socket addresses.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Config`] if either port is 0.
    pub fn new(protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> ForwardResult<Self> {
        if local.port() == 0 || remote.port() == 0 {
            return Err(ForwardError::config(
                &format!("{local} -> {remote}"),
                "ports must be in 1-65535",
            ));
        }
        Ok(Self {
            protocol,
            local,
            remote,
        })
    }

    /// Parse `localPort:remoteAddress:remotePort`, binding locally on `local_ip`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Config`] on a wrong field count, a
    /// non-numeric or out-of-range port, or a remote address that is not an
    /// IP literal.
    pub fn parse(raw: &str, protocol: Protocol, local_ip: IpAddr) -> ForwardResult<Self> {
        let field_count = || ForwardError::config(raw, "expected localPort:remoteAddress:remotePort");

        let (local_port, rest) = raw.split_once(':').ok_or_else(field_count)?;
        let (remote_addr, remote_port) = rest.rsplit_once(':').ok_or_else(field_count)?;

        let remote_ip = match remote_addr
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            Some(v6) => v6
                .parse::<Ipv6Addr>()
                .map(IpAddr::V6)
                .map_err(|_| ForwardError::config(raw, format!("invalid IPv6 address {v6:?}")))?,
            None if remote_addr.contains(':') => return Err(field_count()),
            None => remote_addr.parse::<IpAddr>().map_err(|_| {
                ForwardError::config(raw, format!("invalid IP address {remote_addr:?}"))
            })?,
        };

        let local_port = parse_port(raw, local_port)?;
        let remote_port = parse_port(raw, remote_port)?;

        Ok(Self {
            protocol,
            local: SocketAddr::new(local_ip, local_port),
            remote: SocketAddr::new(remote_ip, remote_port),
        })
    }

    /// Parse the protocol-prefixed form `protocol:localPort:remoteAddress:remotePort`.
    pub fn parse_tagged(raw: &str, local_ip: IpAddr) -> ForwardResult<Self> {
        let (protocol, rest) = raw
            .split_once(':')
            .ok_or_else(|| ForwardError::config(raw, "expected protocol:localPort:remoteAddress:remotePort"))?;
        let protocol = protocol
            .parse::<Protocol>()
            .map_err(|_| ForwardError::config(raw, format!("unknown protocol {protocol:?}")))?;
        Self::parse(rest, protocol, local_ip).map_err(|e| match e {
            ForwardError::Config { reason, .. } => ForwardError::config(raw, reason),
            other => other,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Local endpoint the forwarder binds.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Remote endpoint traffic is relayed to.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Re-serialize as `localPort:remoteAddress:remotePort`.
    pub fn rule_string(&self) -> String {
        // SocketAddr brackets IPv6 literals already.
        format!("{}:{}", self.local.port(), self.remote)
    }

    /// Same rule with the local endpoint replaced, skipping port validation.
    ///
    /// Lets tests bind on an OS-assigned port.
    #[cfg(test)]
    pub(crate) fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = local;
        self
    }
}

impl fmt::Display for AddressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local, self.remote)
    }
}

fn parse_port(raw: &str, field: &str) -> ForwardResult<u16> {
    let port: u32 = field
        .parse()
        .map_err(|_| ForwardError::config(raw, format!("invalid port {field:?}")))?;
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ForwardError::config(
            raw,
            format!("port {port} out of range 1-65535"),
        )),
    }
}
