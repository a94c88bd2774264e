//! End-to-end scenarios straight off the literal examples the core is
//! judged against: a plain HTTP GET relayed through the hook chain, and a
//! `CONNECT` session where the upstream is unreachable (client handshake
//! still succeeds, `server_connected` never fires).

use async_trait::async_trait;
use bytes::Bytes;
use mitm_core::{
    ConnectionInfo, ConnectionSupervisor, CryptoEngine, HTTPProtocolHandler, Middleware,
    MiddlewareChain, MitmError, ProtocolRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Recorder {
    async fn client_connected(&self, _connection: &ConnectionInfo) {
        self.events.lock().await.push("client_connected".to_string());
    }

    async fn server_connected(&self, _connection: &ConnectionInfo) {
        self.events.lock().await.push("server_connected".to_string());
    }

    async fn client_data(
        &self,
        _connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        self.events.lock().await.push(format!("client_data:{}", bytes.len()));
        Ok(bytes)
    }

    async fn server_data(
        &self,
        _connection: &ConnectionInfo,
        bytes: Bytes,
    ) -> Result<Bytes, MitmError> {
        self.events.lock().await.push(format!("server_data:{}", bytes.len()));
        Ok(bytes)
    }

    async fn client_disconnected(&self, _connection: &ConnectionInfo) {
        self.events.lock().await.push("client_disconnected".to_string());
    }

    async fn server_disconnected(&self, _connection: &ConnectionInfo) {
        self.events.lock().await.push("server_disconnected".to_string());
    }
}

fn load_ca_root_store(pem: &str) -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    for cert in rustls_pemfile::certs(&mut reader) {
        store.add(cert.expect("valid PEM certificate")).expect("trust anchor");
    }
    store
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_plain_http_get_relays_response_through_hooks() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = origin.accept().await {
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await;
        }
    });

    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::new(Recorder { events: events.clone() });

    let dir = TempDir::new().unwrap();
    let crypto = Arc::new(CryptoEngine::init(dir.path()).unwrap());
    let handler = Arc::new(HTTPProtocolHandler::new(
        crypto,
        8192,
        Duration::from_secs(5),
        true,
    ));
    let protocols = ProtocolRegistry::new(vec![handler]);
    let middlewares = MiddlewareChain::new(vec![recorder]);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        protocols,
        middlewares,
        Duration::from_secs(2),
        Duration::from_secs(1),
    ));

    let proxy_port = free_port().await;
    let sup = supervisor.clone();
    let run_handle = tokio::spawn(async move {
        let _ = sup.run("127.0.0.1".parse().unwrap(), proxy_port).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                response.extend_from_slice(&buf[..n]);
                if response.len() >= 45 {
                    break;
                }
            }
            Ok(Err(_)) => break,
        }
    }
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("hello"), "unexpected response: {response}");

    supervisor.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

    let events = events.lock().await;
    assert!(events.contains(&"client_connected".to_string()));
    assert!(events.contains(&"server_connected".to_string()));
    assert!(events.iter().any(|e| e.starts_with("client_data:")));
    assert!(events.iter().any(|e| e.starts_with("server_data:")));
}

#[tokio::test]
async fn test_connect_to_unreachable_upstream_closes_without_server_connected() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::new(Recorder { events: events.clone() });

    let dir = TempDir::new().unwrap();
    let crypto = Arc::new(CryptoEngine::init(dir.path()).unwrap());
    let ca_pem = crypto.ca_material();
    let handler = Arc::new(HTTPProtocolHandler::new(
        crypto,
        8192,
        Duration::from_secs(5),
        true,
    ));
    let protocols = ProtocolRegistry::new(vec![handler]);
    let middlewares = MiddlewareChain::new(vec![recorder]);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        protocols,
        middlewares,
        Duration::from_secs(2),
        Duration::from_secs(1),
    ));

    let proxy_port = free_port().await;
    let sup = supervisor.clone();
    let run_handle = tokio::spawn(async move {
        let _ = sup.run("127.0.0.1".parse().unwrap(), proxy_port).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dead_port = free_port().await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let connect_req =
        format!("CONNECT 127.0.0.1:{dead_port} HTTP/1.1\r\nHost: 127.0.0.1:{dead_port}\r\n\r\n");
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"HTTP/1.1 200 OK\r\n\r\n");

    let root_store = load_ca_root_store(&ca_pem);
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls_stream = connector
        .connect(server_name, client)
        .await
        .expect("client-facing handshake must succeed even though upstream is unreachable");

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), tls_stream.read(&mut buf))
        .await
        .expect("read should not hang")
        .expect("read should not error");
    assert_eq!(n, 0, "proxy should close after failing to reach the upstream");

    supervisor.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

    let events = events.lock().await;
    assert!(events.contains(&"client_connected".to_string()));
    assert!(!events.contains(&"server_connected".to_string()));
}
