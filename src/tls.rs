//! TLSContextFactory: turns minted certificate material into TLS configs.
//!
//! Grounded on `proxy_server.rs::mitm_tunnel`'s `ServerConfig::builder()...`
//! call (server side) and `forward_request`'s `hyper_rustls::HttpsConnectorBuilder`
//! (client side), reimplemented directly against `rustls` since the core
//! talks raw TLS streams rather than hyper connectors.

use crate::error::{MitmError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;

pub struct TLSContextFactory;

impl TLSContextFactory {
    /// Server-side TLS config presenting `cert`/`key` as the end-entity,
    /// offering TLS 1.2 and 1.3, no client-certificate requirement,
    /// platform-default cipher selection (rustls' `with_safe_default_protocol_versions`).
    pub fn server_context(
        cert: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert, key)
            .map_err(|e| MitmError::HandshakeFailed(format!("server TLS config: {e}")))?;
        Ok(Arc::new(config))
    }

    /// Client-side TLS config used when the proxy itself connects upstream,
    /// validated against the system trust store (we are emulating a real
    /// client talking to the destination).
    pub fn client_context() -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(MitmError::HandshakeFailed(
                "no root certificates available from the system trust store".into(),
            ));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}
