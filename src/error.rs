use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by servers, clients and sessions.
///
/// Construction-time failures (`Bind`, `Multiplexer`, `InvalidConfig`) are fatal for the
///  instance being built. Everything else is local to a single session or datagram.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to bind UDP socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot register socket for readiness notification: {0}")]
    Multiplexer(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] anyhow::Error),

    #[error("session is no longer active")]
    SessionInactive,

    #[error("session was escaped and is waiting for eviction")]
    SessionEscaped,

    #[error("local endpoint is closed")]
    EndpointClosed,

    #[error("failed to send datagram to {to}: {source}")]
    Send {
        to: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no session registered for peer {0}")]
    UnknownPeer(SocketAddr),

    #[error("attribute '{key}' is not of type {expected}")]
    AttributeType {
        key: String,
        expected: &'static str,
    },
}

impl SessionError {
    /// Send failures are recoverable: they affect neither the loop nor other sessions
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            SessionError::SessionInactive
                | SessionError::SessionEscaped
                | SessionError::EndpointClosed
                | SessionError::Send { .. }
                | SessionError::UnknownPeer(_)
        )
    }
}
