use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;

/// Connection to an origin, plain or TLS, with per-operation timeouts.
///
/// A timeout fires when a single read or write makes no progress for the
/// configured duration; it does not bound the lifetime of the connection.
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Debug for Socket {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Socket")
      .field("inner", &self.inner)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }

  /// Upgrade a plain connection with `func`; TLS connections are returned unchanged.
  pub(crate) async fn tls<F, Fut>(self, func: F) -> std::io::Result<Self>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = std::io::Result<TlsStream<TcpStream>>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      tls => tls,
    };
    Ok(Self::new(inner, self.read_timeout, self.write_timeout))
  }

  /// Drop the per-operation deadlines; reads and writes may then wait forever.
  pub fn without_timeouts(self) -> Self {
    Self::new(self.inner, None, None)
  }

  /// Whether the connection is encrypted
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }

  /// Address of the origin
  pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
    self.inner.tcp().peer_addr()
  }
}

/// Plain TCP or client-side TLS
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl Debug for MaybeTlsStream {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      MaybeTlsStream::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
      MaybeTlsStream::Tls(s) => f.debug_tuple("Tls").field(s.get_ref().0).finish(),
    }
  }
}

impl MaybeTlsStream {
  fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(s) => s.get_ref().0,
    }
  }
}

fn poll_deadline(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Poll<std::io::Result<()>> {
  let Some(timeout) = timeout else {
    return Poll::Pending;
  };
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  match sleep.as_mut().poll(cx) {
    Poll::Ready(()) => {
      *deadline = None;
      Poll::Ready(Err(Error::new(
        ErrorKind::TimedOut,
        format!("{} timed out after {:?}", what, timeout),
      )))
    }
    Poll::Pending => Poll::Pending,
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(r) => {
        this.read_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read"),
    }
  }
}

impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(r) => {
        this.write_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write")
        .map(|r| r.map(|_| 0)),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(r) => {
        this.write_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "flush"),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
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
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

/// A client connection taken over from the HTTP layer.
///
/// Bytes that were read past the request head before the takeover are
/// replayed ahead of anything still unread on the wire.
#[derive(Debug)]
pub struct Hijacked<S> {
  buffered: Bytes,
  inner: S,
}

impl<S> Hijacked<S> {
  /// Wrap `inner`, replaying `buffered` first
  pub fn new(buffered: impl Into<Bytes>, inner: S) -> Self {
    Self {
      buffered: buffered.into(),
      inner,
    }
  }

  /// Bytes not yet replayed
  pub fn buffered(&self) -> &[u8] {
    &self.buffered
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Hijacked<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if this.buffered.has_remaining() {
      let n = this.buffered.len().min(buf.remaining());
      buf.put_slice(&this.buffered.split_to(n));
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Hijacked<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
