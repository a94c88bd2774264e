//! HTTPProtocolHandler: the built-in HTTP(S) protocol state machine
//! (spec §4.4).
//!
//! Grounded on the teacher's `proxy_server.rs::handle_connect`/
//! `mitm_tunnel`/`forward_request`, reimplemented against
//! `ProtocolHandler`/`Host`/`CryptoEngine` instead of hyper. `httparse` plays
//! the role of the HTTP parser collaborator: given bytes, it yields a method,
//! target, and headers, or an error — this module never second-guesses its
//! parse.
//!
//! State machine (NEW -> PARSED -> {CONNECT, PLAIN} -> {TLS_READY, PLAIN_READY}):
//! `connect()` is the whole NEW->PARSED transition (via `parse_request`), then
//! branches on method. `CONNECT` replies with a bare `200`, mints a leaf,
//! TLS-handshakes with the client, dials upstream over TLS, and leaves the
//! `Connection` in TLS_READY. Any other method requires a `Host` header,
//! dials upstream in plaintext, replays the sniffed prefix upstream, and
//! leaves the `Connection` in PLAIN_READY.

use crate::connection::Connection;
use crate::crypto::CryptoEngine;
use crate::error::{MitmError, Result};
use crate::host::Host;
use crate::protocol::{ProtocolDescriptor, ProtocolHandler};
use crate::tls::TLSContextFactory;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const DEFAULT_HTTP_PORT: u16 = 80;
const MAX_HEADERS: usize = 64;

struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_request(prefix: &[u8]) -> Result<ParsedRequest> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);

    match req.parse(prefix) {
        Ok(httparse::Status::Complete(_)) => {
            let method = req
                .method
                .ok_or_else(|| MitmError::invalid_protocol("HTTP request missing method"))?
                .to_string();
            let target = req
                .path
                .ok_or_else(|| MitmError::invalid_protocol("HTTP request missing target"))?
                .to_string();
            let headers = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok(ParsedRequest {
                method,
                target,
                headers,
            })
        }
        Ok(httparse::Status::Partial) => Err(MitmError::invalid_protocol(
            "incomplete HTTP request in sniff prefix",
        )),
        Err(e) => Err(MitmError::invalid_protocol(format!(
            "HTTP parse error: {e}"
        ))),
    }
}

/// Split `host[:port]` into its parts, defaulting the port when absent. Used
/// only where the spec allows a default (the `Host` header in plain HTTP
/// forwarding) — `CONNECT` targets must carry an explicit port, see
/// `parse_connect_authority`.
fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| MitmError::invalid_protocol(format!("invalid port in {authority}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Split a `CONNECT` target into `host:port`. Unlike `split_host_port`, a
/// missing port is `InvalidProtocol` rather than a default — spec §4.4/§8
/// require rejecting a `CONNECT` target with no `:port`.
fn parse_connect_authority(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| MitmError::invalid_protocol(format!("CONNECT target missing port: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| MitmError::invalid_protocol(format!("invalid port in CONNECT target: {target}")))?;
    Ok((host.to_string(), port))
}

/// Extract the authority (`host[:port]`) from an absolute-form request
/// target (`http://host:port/path`), as HTTP/1.0 clients without a `Host`
/// header may send. Returns `None` for origin-form targets (`/path`).
fn absolute_form_authority(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    Some(&rest[..end])
}

pub struct HTTPProtocolHandler {
    crypto: Arc<CryptoEngine>,
    descriptor: ProtocolDescriptor,
}

impl HTTPProtocolHandler {
    pub fn new(crypto: Arc<CryptoEngine>, buffer_size: usize, timeout: Duration, keep_alive: bool) -> Self {
        Self {
            crypto,
            descriptor: ProtocolDescriptor {
                bytes_needed: 8192,
                buffer_size,
                timeout,
                keep_alive,
            },
        }
    }

    async fn handle_connect(&self, connection: &mut Connection, request: &ParsedRequest) -> Result<()> {
        let (host, port) = parse_connect_authority(&request.target)?;

        connection
            .client
            .write_all(CONNECT_RESPONSE)
            .await
            .map_err(MitmError::Io)?;
        connection.client.flush().await.map_err(MitmError::Io)?;

        let (cert_chain, key) = self.crypto.leaf_for(&host).await?;
        let server_config = TLSContextFactory::server_context(cert_chain, key)?;
        let acceptor = TlsAcceptor::from(server_config);

        let client_transport = connection.client.take();
        let client_tls = acceptor.accept(client_transport).await.map_err(|e| {
            // Spec §7: a failed client-facing handshake is subsumed by
            // InvalidProtocol, not surfaced as its own HandshakeFailed kind.
            MitmError::invalid_protocol(format!("client-facing TLS handshake for {host}: {e}"))
        })?;
        connection.client.rewrap(client_tls);

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| MitmError::upstream_unreachable(host.clone(), e))?;
        let peer_addr = tcp.peer_addr().ok();

        let client_config = TLSContextFactory::client_context()?;
        let connector = TlsConnector::from(client_config);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| MitmError::invalid_protocol(format!("invalid SNI host {host}: {e}")))?;
        let upstream_tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MitmError::upstream_unreachable(host.clone(), e))?;

        connection.server = Some(Host::new(upstream_tls, peer_addr));
        Ok(())
    }

    async fn handle_plain(
        &self,
        connection: &mut Connection,
        request: &ParsedRequest,
        prefix: &[u8],
    ) -> Result<()> {
        // Prefer the Host header; fall back to an absolute-form request
        // target (`GET http://host/path HTTP/1.1`) for HTTP/1.0 clients that
        // omit it, matching how such clients are actually observed in practice.
        let authority = request
            .header("host")
            .or_else(|| absolute_form_authority(&request.target))
            .ok_or_else(|| MitmError::invalid_protocol("HTTP request missing Host header"))?;
        let (host, port) = split_host_port(authority, DEFAULT_HTTP_PORT)?;

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| MitmError::upstream_unreachable(host.clone(), e))?;
        let peer_addr = tcp.peer_addr().ok();

        let mut server = Host::new(tcp, peer_addr);
        // The bytes already consumed by protocol sniffing are otherwise lost
        // to the relay loop, so replay them upstream before handing off.
        server.write_all(prefix).await.map_err(MitmError::Io)?;
        server.flush().await.map_err(MitmError::Io)?;

        connection.server = Some(server);
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for HTTPProtocolHandler {
    fn descriptor(&self) -> ProtocolDescriptor {
        self.descriptor
    }

    async fn connect(&self, connection: &mut Connection, prefix: &[u8]) -> Result<()> {
        let request = parse_request(prefix)?;

        if request.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(connection, &request).await
        } else {
            self.handle_plain(connection, &request, prefix).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use tempfile::TempDir;
    use tokio::io::duplex;

    fn engine() -> Arc<CryptoEngine> {
        let dir = TempDir::new().unwrap();
        Arc::new(CryptoEngine::init(dir.path()).unwrap())
    }

    fn handler() -> HTTPProtocolHandler {
        HTTPProtocolHandler::new(engine(), 8192, Duration::from_secs(5), true)
    }

    fn dummy_client() -> Host {
        let (a, _b) = duplex(4096);
        Host::new(a, None)
    }

    #[test]
    fn test_parse_request_extracts_connect_target() {
        let req = parse_request(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.target, "example.test:443");
    }

    #[test]
    fn test_parse_request_reads_host_header() {
        let req = parse_request(b"GET /index.html HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.header("host"), Some("example.test"));
        assert_eq!(req.header("Host"), Some("example.test"));
    }

    #[test]
    fn test_split_host_port_defaults() {
        assert_eq!(
            split_host_port("example.test", 80).unwrap(),
            ("example.test".to_string(), 80)
        );
        assert_eq!(
            split_host_port("example.test:8080", 80).unwrap(),
            ("example.test".to_string(), 8080)
        );
    }

    #[test]
    fn test_connect_authority_requires_port() {
        assert_eq!(
            parse_connect_authority("example.test:443").unwrap(),
            ("example.test".to_string(), 443)
        );
        let err = parse_connect_authority("example.test").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProtocol);
    }

    #[tokio::test]
    async fn test_connect_without_port_is_rejected_before_minting() {
        let handler = handler();
        let mut conn = Connection::new(dummy_client());
        let prefix = b"CONNECT example.test HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let err = handler.connect(&mut conn, prefix).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProtocol);
        assert!(!conn.is_resolved());
    }

    #[test]
    fn test_absolute_form_authority_extracted() {
        assert_eq!(
            absolute_form_authority("http://example.test:8080/path"),
            Some("example.test:8080")
        );
        assert_eq!(absolute_form_authority("http://example.test"), Some("example.test"));
        assert_eq!(absolute_form_authority("/path"), None);
    }

    #[test]
    fn test_partial_request_is_invalid_protocol() {
        let err = parse_request(b"GET / HTTP/1.1\r\nHost: exam").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProtocol);
    }

    #[tokio::test]
    async fn test_plain_request_without_host_header_rejected() {
        let handler = handler();
        let mut conn = Connection::new(dummy_client());
        let prefix = b"GET / HTTP/1.0\r\n\r\n";
        let err = handler.connect(&mut conn, prefix).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProtocol);
        assert!(!conn.is_resolved());
    }

    #[tokio::test]
    async fn test_non_http_prefix_rejected() {
        let handler = handler();
        let mut conn = Connection::new(dummy_client());
        let err = handler
            .connect(&mut conn, b"\x16\x03\x01\x00\xa5")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProtocol);
    }

    #[test]
    fn test_descriptor_reflects_configured_values() {
        let h = HTTPProtocolHandler::new(engine(), 4096, Duration::from_secs(2), false);
        let d = h.descriptor();
        assert_eq!(d.buffer_size, 4096);
        assert_eq!(d.timeout, Duration::from_secs(2));
        assert!(!d.keep_alive);
    }

    #[tokio::test]
    async fn test_plain_request_resolves_host_from_absolute_form_target() {
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = origin.accept().await;
        });

        let handler = handler();
        let mut conn = Connection::new(dummy_client());
        let prefix = format!("GET http://127.0.0.1:{origin_port}/ HTTP/1.1\r\n\r\n");
        handler.connect(&mut conn, prefix.as_bytes()).await.unwrap();
        assert!(conn.is_resolved());
    }
}
