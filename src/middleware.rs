//! MiddlewareChain: the hook pipeline observing/mutating decrypted byte
//! streams and lifecycle events (spec §4.5).
//!
//! Each middleware method returns a `Result` rather than panicking on
//! failure, matching the rest of the crate's error-propagation style; the
//! chain itself implements "hook exceptions are logged and do not tear down
//! the connection" (spec §4.5, §7) by logging an `Err` and continuing with
//! the last-good, unmodified bytes.

use crate::error::MitmError;
use crate::protocol::ProtocolDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Read-only context handed to every hook. Connections are driven by two
/// concurrent relay tasks (client→server, server→client) once resolved, so
/// hooks observe connection metadata rather than taking a mutable borrow of
/// the live `Connection`/`Host` I/O halves.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub descriptor: Option<ProtocolDescriptor>,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn mitm_started(&self, _host: &str, _port: u16) {}

    async fn client_connected(&self, _connection: &ConnectionInfo) {}

    async fn server_connected(&self, _connection: &ConnectionInfo) {}

    async fn client_data(
        &self,
        _connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        Ok(bytes)
    }

    async fn server_data(
        &self,
        _connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        Ok(bytes)
    }

    async fn client_disconnected(&self, _connection: &ConnectionInfo) {}

    async fn server_disconnected(&self, _connection: &ConnectionInfo) {}
}

#[derive(Clone)]
pub struct MiddlewareChain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }

    pub async fn mitm_started(&self, host: &str, port: u16) {
        for m in self.middlewares.iter() {
            m.mitm_started(host, port).await;
        }
    }

    pub async fn client_connected(&self, connection: &ConnectionInfo) {
        for m in self.middlewares.iter() {
            m.client_connected(connection).await;
        }
    }

    pub async fn server_connected(&self, connection: &ConnectionInfo) {
        for m in self.middlewares.iter() {
            m.server_connected(connection).await;
        }
    }

    /// Thread `bytes` through every middleware in order; the output of one
    /// is the input of the next, and the final output is what is actually
    /// written to the peer.
    pub async fn client_data(&self, connection: &ConnectionInfo, mut bytes: Bytes) -> Bytes {
        for m in self.middlewares.iter() {
            bytes = match m.client_data(connection, bytes.clone()).await {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(error = %e, "client_data hook failed, forwarding bytes unmodified");
                    bytes
                }
            };
        }
        bytes
    }

    pub async fn server_data(&self, connection: &ConnectionInfo, mut bytes: Bytes) -> Bytes {
        for m in self.middlewares.iter() {
            bytes = match m.server_data(connection, bytes.clone()).await {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(error = %e, "server_data hook failed, forwarding bytes unmodified");
                    bytes
                }
            };
        }
        bytes
    }

    pub async fn client_disconnected(&self, connection: &ConnectionInfo) {
        for m in self.middlewares.iter() {
            m.client_disconnected(connection).await;
        }
    }

    pub async fn server_disconnected(&self, connection: &ConnectionInfo) {
        for m in self.middlewares.iter() {
            m.server_disconnected(connection).await;
        }
    }
}

/// Built-in `Log` middleware (spec §6's default `middlewares: [Log]`).
/// Mirrors the teacher's `tracing::info!("{} {}", method, uri)` call in
/// `proxy_server.rs`, generalized to byte-stream events: we log chunk sizes
/// only, never content, since persisting intercepted traffic is an explicit
/// non-goal.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn mitm_started(&self, host: &str, port: u16) {
        tracing::info!(host, port, "mitm started");
    }

    async fn client_connected(&self, connection: &ConnectionInfo) {
        tracing::info!(connection_id = connection.id, addr = ?connection.client_addr, "client connected");
    }

    async fn server_connected(&self, connection: &ConnectionInfo) {
        tracing::info!(connection_id = connection.id, addr = ?connection.server_addr, "server connected");
    }

    async fn client_data(
        &self,
        connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        tracing::debug!(connection_id = connection.id, len = bytes.len(), "client->server");
        Ok(bytes)
    }

    async fn server_data(
        &self,
        connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        tracing::debug!(connection_id = connection.id, len = bytes.len(), "server->client");
        Ok(bytes)
    }

    async fn client_disconnected(&self, connection: &ConnectionInfo) {
        tracing::info!(connection_id = connection.id, "client disconnected");
    }

    async fn server_disconnected(&self, connection: &ConnectionInfo) {
        tracing::info!(connection_id = connection.id, "server disconnected");
    }
}
