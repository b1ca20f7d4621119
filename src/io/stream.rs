//! MaybeSecureStream - wrapper for optionally TLS-encrypted client streams

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

/// A node connection that may or may not be TLS-encrypted
///
/// Framing and multiplexing sit on top of this, so plain and encrypted
/// connections share one code path.
pub enum MaybeSecureStream {
    /// Plain TCP stream (no encryption)
    Plain(TcpStream),
    /// TLS-encrypted stream
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeSecureStream {
    pub fn plain(stream: TcpStream) -> Self {
        MaybeSecureStream::Plain(stream)
    }

    #[cfg(feature = "tls")]
    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        MaybeSecureStream::Tls(Box::new(stream))
    }

    pub fn is_tls(&self) -> bool {
        match self {
            MaybeSecureStream::Plain(_) => false,
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(_) => true,
        }
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            MaybeSecureStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.tcp().local_addr()
    }
}

impl AsyncRead for MaybeSecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeSecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeSecureStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            MaybeSecureStream::Plain(s) => s.is_write_vectored(),
            #[cfg(feature = "tls")]
            MaybeSecureStream::Tls(s) => s.is_write_vectored(),
        }
    }
}
