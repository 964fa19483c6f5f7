//! Error types for the server and its connections.
//!
//! Two layers:
//! - `ServerError`: startup and shared infrastructure failures. These stop
//!   the server (or keep it from starting).
//! - `ConnectionError`: failures scoped to a single connection. The owning
//!   worker closes that connection and nothing else.

use std::io;
use std::net::{AddrParseError, SocketAddr};
use thiserror::Error;

/// Failures of the listening socket or loop threads.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {source}")]
    Address {
        addr: String,
        #[source]
        source: AddrParseError,
    },

    /// The port is unavailable or already bound. Fatal, aborts startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listening socket failed after startup.
    #[error("listening socket failed: {0}")]
    AcceptorFatal(#[source] io::Error),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Failures isolated to one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// TLS negotiation failed before the session was established.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] rustls::Error),

    /// TLS record error after the handshake completed.
    #[error("TLS session error: {0}")]
    Tls(#[source] rustls::Error),

    /// Socket-level read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl ConnectionError {
    pub fn is_handshake(&self) -> bool {
        matches!(self, ConnectionError::Handshake(_))
    }
}
