//! `Host`: one endpoint of a relayed pair (spec §3).
//!
//! A `Host` owns a single bidirectional transport — a plain `TcpStream`, or
//! a `TlsStream` once the protocol handler has performed a handshake on it
//! — erased behind a trait object so the protocol handler and the
//! supervisor's relay loop don't need to be generic over the concrete
//! transport. Per the design note in spec §9 ("split each Host's socket
//! into independent read and write halves so the two relay directions can
//! progress without contending for a single-socket lock"), the supervisor
//! splits this stream with `tokio::io::split` only once it enters the relay
//! loop — `split` hands back a `ReadHalf`/`WriteHalf` pair that share the
//! underlying transport through an internal lock, letting each direction
//! progress independently without either side needing a `&mut` on the
//! whole `Host`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Marker trait erasing the concrete transport (`TcpStream`,
/// `tokio_rustls::server::TlsStream<TcpStream>`,
/// `tokio_rustls::client::TlsStream<TcpStream>`, ...) behind one object
/// type.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// One endpoint of a relayed pair: a transport, the observed address, and
/// whether the supervisor owns teardown.
pub struct Host {
    // `None` only transiently, while a protocol handler is mid-handshake
    // (see `take`/`rewrap`); every other observer sees `Some`.
    stream: Option<BoxedTransport>,
    pub addr: Option<SocketAddr>,
    /// Whether the supervisor should close the underlying transport on
    /// teardown. `false` means a caller outside the supervisor owns that
    /// lifecycle (e.g. embedding this crate as a library against a socket
    /// it does not own) — the supervisor still stops reading/writing, it
    /// just skips the close.
    pub managed: bool,
}

impl Host {
    pub fn new(stream: impl Transport + 'static, addr: Option<SocketAddr>) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            addr,
            managed: true,
        }
    }

    pub fn unmanaged(stream: impl Transport + 'static, addr: Option<SocketAddr>) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            addr,
            managed: false,
        }
    }

    /// Take ownership of the transport, e.g. to hand it to a TLS acceptor
    /// or connector. Must be followed by `rewrap` before this `Host` is
    /// read from or written to again.
    pub fn take(&mut self) -> BoxedTransport {
        self.stream.take().expect("Host::take called twice without rewrap")
    }

    /// Install a new transport, e.g. the `TlsStream` produced by wrapping
    /// the transport returned by `take`. Preserves `addr`/`managed`.
    pub fn rewrap(&mut self, stream: impl Transport + 'static) {
        self.stream = Some(Box::new(stream));
    }

    /// Consume the `Host`, handing back its transport (to be split by the
    /// relay loop) plus whether the supervisor owns its teardown.
    pub fn into_parts(self) -> (BoxedTransport, bool) {
        (
            self.stream.expect("Host::into_parts called mid-handshake"),
            self.managed,
        )
    }

    pub async fn close(&mut self) {
        if self.managed {
            if let Some(stream) = self.stream.as_mut() {
                let _ = stream.shutdown().await;
            }
        }
    }
}

impl AsyncRead for Host {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let stream = self.stream.as_mut().expect("Host read while mid-handshake");
        Pin::new(stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Host {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let stream = self.stream.as_mut().expect("Host write while mid-handshake");
        Pin::new(stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let stream = self.stream.as_mut().expect("Host flush while mid-handshake");
        Pin::new(stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let stream = self.stream.as_mut().expect("Host shutdown while mid-handshake");
        Pin::new(stream).poll_shutdown(cx)
    }
}
