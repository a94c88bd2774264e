//! ConnectionSupervisor: the accept loop and per-connection algorithm
//! (spec §4.6, §5).
//!
//! Grounded on the teacher's `ProxyServer::run`/`handle_connection` accept
//! loop (bind, accept, spawn-per-connection), generalized from hyper's
//! request/response service model to the raw `client_connected` ->
//! dispatch -> relay -> disconnect pipeline this core implements instead.

use crate::connection::Connection;
use crate::error::{MitmError, Result};
use crate::host::Host;
use crate::middleware::{ConnectionInfo, MiddlewareChain};
use crate::protocol::{ProtocolDescriptor, ProtocolRegistry};
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

struct IdleTracker {
    client_idle: AtomicBool,
    server_idle: AtomicBool,
}

impl IdleTracker {
    fn new() -> Self {
        Self {
            client_idle: AtomicBool::new(false),
            server_idle: AtomicBool::new(false),
        }
    }

    fn set(&self, direction: Direction, idle: bool) {
        match direction {
            Direction::ClientToServer => self.client_idle.store(idle, Ordering::Relaxed),
            Direction::ServerToClient => self.server_idle.store(idle, Ordering::Relaxed),
        }
    }

    fn both_idle(&self) -> bool {
        self.client_idle.load(Ordering::Relaxed) && self.server_idle.load(Ordering::Relaxed)
    }
}

/// Accepts client sockets and drives each through dispatch, relay, and
/// teardown. Owns no per-connection state beyond what each spawned task
/// needs; the only cross-connection shared state is the `ProtocolRegistry`
/// (itself wrapping the process-wide `CryptoEngine`) and `MiddlewareChain`.
pub struct ConnectionSupervisor {
    protocols: Arc<ProtocolRegistry>,
    middlewares: MiddlewareChain,
    initial_read_timeout: Duration,
    shutdown_grace: Duration,
    shutdown: Arc<Notify>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    next_id: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        protocols: ProtocolRegistry,
        middlewares: MiddlewareChain,
        initial_read_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            protocols: Arc::new(protocols),
            middlewares,
            initial_read_timeout,
            shutdown_grace,
            shutdown: Arc::new(Notify::new()),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind and accept until `stop()` is called. Transient accept errors are
    /// logged and retried; the loop only returns `Err` on a fatal listener
    /// error (e.g. the bind itself failing, or the socket dying outright).
    pub async fn run(&self, host: IpAddr, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await.map_err(MitmError::Io)?;
        tracing::info!(%host, port, "proxy listening");
        self.middlewares.mitm_started(&host.to_string(), port).await;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            let protocols = self.protocols.clone();
                            let middlewares = self.middlewares.clone();
                            let initial_read_timeout = self.initial_read_timeout;
                            let mut tasks = self.tasks.lock().await;
                            tasks.spawn(async move {
                                Self::handle_connection(id, stream, addr, protocols, middlewares, initial_read_timeout).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "transient accept error");
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting, let in-flight connections drain for up to the
    /// configured grace window, then abort whatever remains.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!("shutdown grace window elapsed, aborting remaining connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    async fn handle_connection(
        id: u64,
        stream: tokio::net::TcpStream,
        addr: std::net::SocketAddr,
        protocols: Arc<ProtocolRegistry>,
        middlewares: MiddlewareChain,
        initial_read_timeout: Duration,
    ) {
        let connection = Connection::new(Host::new(stream, Some(addr)));
        let entry_info = ConnectionInfo {
            id,
            client_addr: Some(addr),
            server_addr: None,
            descriptor: None,
        };
        middlewares.client_connected(&entry_info).await;

        let (resolved, info) = Self::drive(id, connection, &protocols, &middlewares, initial_read_timeout).await;

        middlewares.client_disconnected(&info).await;
        if resolved {
            middlewares.server_disconnected(&info).await;
        }
    }

    /// Steps 3-6 of the per-connection algorithm: read the sniff prefix,
    /// dispatch, fire `server_connected`, relay. Returns whether resolution
    /// succeeded (and thus whether `server_connected`/`server_disconnected`
    /// bracket this connection) plus the richest `ConnectionInfo` available.
    async fn drive(
        id: u64,
        mut connection: Connection,
        protocols: &ProtocolRegistry,
        middlewares: &MiddlewareChain,
        initial_read_timeout: Duration,
    ) -> (bool, ConnectionInfo) {
        let entry_info = ConnectionInfo {
            id,
            client_addr: connection.client.addr,
            server_addr: None,
            descriptor: None,
        };

        let max_prefix = protocols.max_prefix_bytes().max(1);
        let mut buf = vec![0u8; max_prefix];
        let read = tokio::time::timeout(initial_read_timeout, connection.client.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(connection_id = id, error = %e, "initial read failed");
                0
            }
            Err(_) => {
                tracing::debug!(connection_id = id, "initial read timed out");
                0
            }
        };

        if n == 0 {
            connection.client.close().await;
            return (false, entry_info);
        }
        buf.truncate(n);

        if let Err(e) = protocols.dispatch(&mut connection, &buf).await {
            tracing::debug!(connection_id = id, error = %e, "protocol dispatch failed");
            connection.client.close().await;
            return (false, entry_info);
        }

        let descriptor = *connection.descriptor();
        let info = ConnectionInfo {
            id,
            client_addr: connection.client.addr,
            server_addr: connection.server.as_ref().and_then(|h| h.addr),
            descriptor: Some(descriptor),
        };
        middlewares.server_connected(&info).await;

        Self::relay(connection, middlewares, info.clone(), descriptor).await;

        (true, info)
    }

    /// The two-direction relay loop (spec §4.6 step 6, §5, §9 "interleaved
    /// read/write halves"). Consumes `connection`: both `Host`s are split
    /// into independent read/write halves here, and each direction tears
    /// down its own write side on exit.
    async fn relay(
        connection: Connection,
        middlewares: &MiddlewareChain,
        info: ConnectionInfo,
        descriptor: ProtocolDescriptor,
    ) {
        let Connection { client, server, .. } = connection;
        let server = match server {
            Some(s) => s,
            None => return,
        };

        let (client_transport, client_managed) = client.into_parts();
        let (server_transport, server_managed) = server.into_parts();

        let (client_r, client_w) = tokio::io::split(client_transport);
        let (server_r, server_w) = tokio::io::split(server_transport);

        let idle = Arc::new(IdleTracker::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let c2s = Self::direction_loop(
            Direction::ClientToServer,
            client_r,
            server_w,
            descriptor.buffer_size,
            descriptor.timeout,
            descriptor.keep_alive,
            middlewares.clone(),
            info.clone(),
            idle.clone(),
            stop_tx.clone(),
            stop_rx.clone(),
            server_managed,
        );
        let s2c = Self::direction_loop(
            Direction::ServerToClient,
            server_r,
            client_w,
            descriptor.buffer_size,
            descriptor.timeout,
            descriptor.keep_alive,
            middlewares.clone(),
            info.clone(),
            idle,
            stop_tx,
            stop_rx,
            client_managed,
        );

        let (c2s_result, s2c_result) = tokio::join!(c2s, s2c);
        if let Err(e) = c2s_result {
            tracing::debug!(connection_id = info.id, error = %e, "client->server relay ended");
        }
        if let Err(e) = s2c_result {
            tracing::debug!(connection_id = info.id, error = %e, "server->client relay ended");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn direction_loop<R, W>(
        direction: Direction,
        mut reader: R,
        mut writer: W,
        buffer_size: usize,
        idle_timeout: Duration,
        keep_alive: bool,
        middlewares: MiddlewareChain,
        info: ConnectionInfo,
        idle: Arc<IdleTracker>,
        stop_tx: watch::Sender<bool>,
        mut stop_rx: watch::Receiver<bool>,
        writer_managed: bool,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; buffer_size.max(1)];

        let result = loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    break Ok(());
                }
                outcome = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => {
                    match outcome {
                        Ok(Ok(0)) => {
                            idle.set(direction, true);
                            break Ok(());
                        }
                        Ok(Ok(n)) => {
                            idle.set(direction, false);
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            let out = match direction {
                                Direction::ClientToServer => middlewares.client_data(&info, chunk).await,
                                Direction::ServerToClient => middlewares.server_data(&info, chunk).await,
                            };
                            if let Err(e) = writer.write_all(&out).await {
                                break Err(MitmError::Io(e));
                            }
                            if let Err(e) = writer.flush().await {
                                break Err(MitmError::Io(e));
                            }
                            if !keep_alive && direction == Direction::ServerToClient {
                                let _ = stop_tx.send(true);
                                break Ok(());
                            }
                        }
                        Ok(Err(e)) => break Err(MitmError::Io(e)),
                        Err(_) => {
                            idle.set(direction, true);
                            if idle.both_idle() {
                                break Err(MitmError::Timeout);
                            }
                        }
                    }
                }
            }
        };

        if writer_managed {
            let _ = writer.shutdown().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoEngine;
    use crate::http_protocol::HTTPProtocolHandler;
    use crate::middleware::LoggingMiddleware;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn registry() -> ProtocolRegistry {
        let dir = TempDir::new().unwrap();
        let crypto = Arc::new(CryptoEngine::init(dir.path()).unwrap());
        let handler = Arc::new(HTTPProtocolHandler::new(
            crypto,
            8192,
            Duration::from_secs(5),
            true,
        ));
        ProtocolRegistry::new(vec![handler])
    }

    #[tokio::test]
    async fn test_garbage_prefix_closes_without_server_connected() {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            registry(),
            MiddlewareChain::new(vec![Arc::new(LoggingMiddleware)]),
            Duration::from_millis(500),
            Duration::from_secs(1),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sup = supervisor.clone();
        let run_handle = tokio::spawn(async move {
            let _ = sup.run(addr.ip(), addr.port()).await;
        });

        // Give the accept loop a moment to bind before connecting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "no response should be sent for an invalid prefix");

        supervisor.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
    }

    struct StartRecorder {
        started: Arc<Mutex<Vec<(String, u16)>>>,
    }

    #[async_trait::async_trait]
    impl crate::middleware::Middleware for StartRecorder {
        async fn mitm_started(&self, host: &str, port: u16) {
            self.started.lock().await.push((host.to_string(), port));
        }
    }

    #[tokio::test]
    async fn test_run_fires_mitm_started_after_bind() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            registry(),
            MiddlewareChain::new(vec![Arc::new(StartRecorder { started: started.clone() })]),
            Duration::from_millis(500),
            Duration::from_secs(1),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sup = supervisor.clone();
        let run_handle = tokio::spawn(async move {
            let _ = sup.run(addr.ip(), addr.port()).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

        let started = started.lock().await;
        assert_eq!(started.as_slice(), &[(addr.ip().to_string(), addr.port())]);
    }
}
