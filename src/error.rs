//! Typed error taxonomy for the proxy core.
//!
//! Every fallible operation in this crate returns `Result<T, MitmError>`.
//! `MitmError::kind()` maps onto the five variants from the data model:
//! `InvalidProtocol`, `HandshakeFailed`, `UpstreamUnreachable`, `Timeout`,
//! `PeerClosed`.

use std::fmt;
use std::io;

/// The coarse-grained classification used by the supervisor to decide what
/// to log and which lifecycle hooks to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The first bytes could not be matched to any registered protocol
    /// handler, or a handler's hard constraints were violated (missing
    /// `Host`, malformed `CONNECT` target, failed client-side handshake).
    InvalidProtocol,
    /// A TLS handshake failed. Surfaced to callers folded into
    /// `InvalidProtocol` (client side) or `UpstreamUnreachable` (server
    /// side), per spec.
    HandshakeFailed,
    /// DNS resolution, TCP connect, or upstream TLS handshake failed.
    UpstreamUnreachable,
    /// Both relay directions exceeded the idle window.
    Timeout,
    /// Normal EOF from either peer.
    PeerClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidProtocol => "invalid protocol",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::UpstreamUnreachable => "upstream unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PeerClosed => "peer closed",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MitmError {
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("upstream unreachable ({host}): {source}")]
    UpstreamUnreachable {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("idle timeout exceeded")]
    Timeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MitmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MitmError::InvalidProtocol(_) => ErrorKind::InvalidProtocol,
            MitmError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            MitmError::UpstreamUnreachable { .. } => ErrorKind::UpstreamUnreachable,
            MitmError::Timeout => ErrorKind::Timeout,
            MitmError::PeerClosed => ErrorKind::PeerClosed,
            MitmError::Io(_) | MitmError::Certificate(_) | MitmError::Config(_) => {
                ErrorKind::InvalidProtocol
            }
        }
    }

    pub fn invalid_protocol(msg: impl Into<String>) -> Self {
        MitmError::InvalidProtocol(msg.into())
    }

    pub fn upstream_unreachable(host: impl Into<String>, source: io::Error) -> Self {
        MitmError::UpstreamUnreachable {
            host: host.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MitmError>;
