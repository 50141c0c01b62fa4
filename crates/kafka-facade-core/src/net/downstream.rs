//! Stream abstraction for backend-facing connections.
//!
//! Provides a unified interface over plain TCP and TLS streams for the
//! downstream side, where the proxy is the TLS client.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A stream that can be either plain TCP or TLS-encrypted toward a backend
/// node.
pub enum DownstreamStream {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-encrypted connection; the proxy is the TLS client.
    Tls(TlsStream<TcpStream>),
}

impl DownstreamStream {
    /// Create a new plain TCP stream.
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    /// Create a new TLS stream (client-side).
    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        Self::Tls(stream)
    }

    /// Check if this is a TLS connection.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for DownstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DownstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            DownstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DownstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DownstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            DownstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DownstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            DownstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DownstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            DownstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
