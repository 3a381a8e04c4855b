use crate::rule::Protocol;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the forwarding engine.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unable to parse {input:?}: {reason}")]
    Config { input: String, reason: String },

    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out")]
    DialTimeout { addr: SocketAddr },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    pub(crate) fn config(input: &str, reason: impl Into<String>) -> Self {
        ForwardError::Config {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;
