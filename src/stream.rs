//! Upstream stream wrapper.
//!
//! An upstream connection is plain TCP, TLS to the origin, or TLS nested
//! inside an already-established tunnel (origin TLS through an HTTPS super
//! proxy), so the TLS variant wraps another `MaybeTlsStream`.

use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A byte stream that may have one or more TLS layers on top of TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// plain TCP
  Tcp(TcpStream),
  /// client-side TLS over another stream
  Tls(Box<TlsStream<MaybeTlsStream>>),
}

impl From<TcpStream> for MaybeTlsStream {
  fn from(stream: TcpStream) -> Self {
    MaybeTlsStream::Tcp(stream)
  }
}

impl From<TlsStream<MaybeTlsStream>> for MaybeTlsStream {
  fn from(stream: TlsStream<MaybeTlsStream>) -> Self {
    MaybeTlsStream::Tls(Box::new(stream))
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
