//! `Connection`: the pair `{client, server, protocol}` representing one
//! intercepted session (spec §3).

use crate::host::Host;
use crate::protocol::ProtocolDescriptor;

/// Invariant: `client` is always fully initialized by the time a
/// `Connection` is constructed; `server` is `None` until a protocol handler
/// successfully resolves the upstream. `protocol`, once set by a successful
/// `ProtocolHandler::connect`, is never changed again for the life of the
/// connection.
pub struct Connection {
    pub client: Host,
    pub server: Option<Host>,
    pub protocol: Option<ProtocolDescriptor>,
}

impl Connection {
    pub fn new(client: Host) -> Self {
        Self {
            client,
            server: None,
            protocol: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.server.is_some()
    }

    /// The descriptor set by the winning protocol handler. Panics if called
    /// before resolution — callers only reach the relay loop after
    /// `ProtocolRegistry::dispatch` has succeeded.
    pub fn descriptor(&self) -> &ProtocolDescriptor {
        self.protocol
            .as_ref()
            .expect("descriptor queried before protocol resolution")
    }
}
