//! Scalar configuration surface for the proxy (spec §6, "Configuration
//! surface (enumerated)").
//!
//! The non-scalar entries of that table — `protocols`, `middlewares`,
//! `certificate_authority` — are runtime objects (trait objects / an
//! already-constructed `CryptoEngine`) and are therefore injected directly
//! into [`crate::supervisor::ConnectionSupervisor::new`] rather than carried
//! here. Loading this struct from a file or the environment is an ambient
//! convenience, grounded on the teacher's `ProxyConfig::from_file`/`from_env`,
//! not a requirement of the core.

use crate::error::{MitmError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Per-chunk relay read size, shared by every registered protocol unless
    /// the protocol's own `ProtocolDescriptor` overrides it.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Grace window in seconds for `stop()` to let in-flight connections
    /// drain before forcing a close.
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    #[serde(default = "default_cache_size")]
    pub lru_max_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsConfig::default(),
            buffer_size: default_buffer_size(),
            timeout_secs: default_timeout_secs(),
            keep_alive: default_true(),
            shutdown_grace_secs: default_grace_secs(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            lru_max_size: default_cache_size(),
        }
    }
}

impl ProxyConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&contents).map_err(|e| MitmError::Config(e.to_string()))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MITM_PROXY_HOST") {
            if let Ok(ip) = addr.parse() {
                config.host = ip;
            }
        }
        if let Ok(port) = std::env::var("MITM_PROXY_PORT") {
            if let Ok(p) = port.parse() {
                config.port = p;
            }
        }
        if let Ok(dir) = std::env::var("MITM_PROXY_CERT_DIR") {
            config.tls.cert_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| MitmError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_port() -> u16 {
    8888
}

fn default_cert_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mitm-core")
        .join("certs")
}

fn default_buffer_size() -> usize {
    8192
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    10
}

fn default_cache_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}
