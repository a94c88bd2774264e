//! ProtocolRegistry: ordered set of protocol handlers, dispatch by
//! bounded-prefix sniffing (spec §4.3, §9 "Dynamic dispatch over
//! protocol/middleware classes").

use crate::connection::Connection;
use crate::error::{MitmError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// The static configuration of a protocol handler (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct ProtocolDescriptor {
    /// Minimum prefix required to attempt identification.
    pub bytes_needed: usize,
    /// Per-chunk relay read size.
    pub buffer_size: usize,
    /// Idle timeout for relay reads.
    pub timeout: Duration,
    /// Whether the relay loop restarts after one completed
    /// request/response cycle.
    pub keep_alive: bool,
}

/// Capability trait implemented by anything that can claim a connection
/// from a byte prefix and set up the upstream side. On success, the
/// implementation is responsible for populating `connection.server` and
/// `connection.protocol`.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn descriptor(&self) -> ProtocolDescriptor;

    /// Attempt to claim `connection` based on `prefix`. Must return
    /// `Err(MitmError::InvalidProtocol(_))` (and must not mutate
    /// `connection.server`/`connection.protocol`) if `prefix` does not match
    /// this handler's protocol, so the registry can try the next handler.
    async fn connect(&self, connection: &mut Connection, prefix: &[u8]) -> Result<()>;
}

pub struct ProtocolRegistry {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new(handlers: Vec<Arc<dyn ProtocolHandler>>) -> Self {
        Self { handlers }
    }

    /// The maximum prefix length any registered handler requires.
    pub fn max_prefix_bytes(&self) -> usize {
        self.handlers
            .iter()
            .map(|h| h.descriptor().bytes_needed)
            .max()
            .unwrap_or(0)
    }

    /// Try each handler in insertion order; the first one whose `connect`
    /// does not raise `InvalidProtocol` wins. If every handler rejects the
    /// prefix, dispatch fails with `InvalidProtocol`.
    pub async fn dispatch(&self, connection: &mut Connection, prefix: &[u8]) -> Result<()> {
        for handler in &self.handlers {
            match handler.connect(connection, prefix).await {
                Ok(()) => {
                    if connection.protocol.is_none() {
                        connection.protocol = Some(handler.descriptor());
                    }
                    return Ok(());
                }
                Err(MitmError::InvalidProtocol(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(MitmError::invalid_protocol(
            "no registered protocol handler accepted the prefix",
        ))
    }
}
