//! Core of a customizable man-in-the-middle TCP proxy: connection
//! dispatch, HTTP(S) protocol handling, and a certificate authority engine
//! for on-demand leaf issuance.
//!
//! This crate exposes the building blocks (`CryptoEngine`,
//! `TLSContextFactory`, `ProtocolRegistry`, `HTTPProtocolHandler`,
//! `MiddlewareChain`, `ConnectionSupervisor`) without opinion on how they're
//! wired together; `main.rs` shows one way to assemble them.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod host;
pub mod http_protocol;
pub mod middleware;
pub mod protocol;
pub mod supervisor;
pub mod tls;

pub use config::{ProxyConfig, TlsConfig};
pub use connection::Connection;
pub use crypto::{CryptoEngine, CryptoEngineStats};
pub use error::{ErrorKind, MitmError, Result};
pub use host::{BoxedTransport, Host, Transport};
pub use http_protocol::HTTPProtocolHandler;
pub use middleware::{ConnectionInfo, LoggingMiddleware, Middleware, MiddlewareChain};
pub use protocol::{ProtocolDescriptor, ProtocolHandler, ProtocolRegistry};
pub use supervisor::ConnectionSupervisor;
pub use tls::TLSContextFactory;
