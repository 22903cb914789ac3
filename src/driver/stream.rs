//! Stream abstraction for plain TCP and TLS connections.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A server connection stream (TCP or TLS).
#[allow(clippy::large_enum_variant)]
pub enum ChStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl ChStream {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ChStream::Tcp(stream) => stream.local_addr(),
            ChStream::Tls(stream) => stream.get_ref().0.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ChStream::Tcp(stream) => stream.peer_addr(),
            ChStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ChStream::Tls(_))
    }
}

impl AsyncRead for ChStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ChStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ChStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ChStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ChStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
