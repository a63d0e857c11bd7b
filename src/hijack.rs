//! Per-request hijack hooks.
//!
//! A [`Hijacker`] is bound to a single request. It observes the parsed request
//! and response heads and may tee the body streams or replace the response
//! entirely. Hijackers come out of a [`HijackerPool`] so implementations can
//! keep the hot path allocation-free; the engine guarantees one `put` for
//! every `get`, error paths included.

use crate::header::Header;
use crate::response::ResponseLine;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Sink for teed body bytes.
pub type BodyWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Source for a substituted response.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Hooks invoked around one proxied request.
#[async_trait]
pub trait Hijacker: Send {
  /// Called once the request headers are parsed, before the body is
  /// forwarded. A returned writer receives a copy of the request body.
  async fn on_request(&mut self, _header: &Header, _raw_header: &[u8]) -> Option<BodyWriter> {
    None
  }

  /// Called immediately after `on_request`. A returned reader short-circuits
  /// the upstream entirely: its bytes are streamed to the client as the whole
  /// response (headers included) and the request cycle ends.
  async fn hijack_response(&mut self) -> Option<BodyReader> {
    None
  }

  /// Called once the upstream response headers are parsed, before the body is
  /// relayed. A returned writer receives a copy of the response body.
  async fn on_response(
    &mut self,
    _response_line: &ResponseLine,
    _header: &Header,
    _raw_header: &[u8],
  ) -> Option<BodyWriter> {
    None
  }
}

/// Hands out hijackers, one per request.
pub trait HijackerPool: Send + Sync {
  /// Borrow a hijacker bound to the given request coordinates.
  fn get(
    &self,
    client_addr: SocketAddr,
    target_host: &str,
    method: &[u8],
    path: &[u8],
  ) -> Box<dyn Hijacker>;

  /// Return a hijacker once its request completes.
  fn put(&self, hijacker: Box<dyn Hijacker>);
}

/// A hijacker that observes nothing.
pub struct NoopHijacker;

#[async_trait]
impl Hijacker for NoopHijacker {}

/// Pool of [`NoopHijacker`]s for embedders without interception needs.
pub struct NoopHijackerPool;

impl HijackerPool for NoopHijackerPool {
  fn get(
    &self,
    _client_addr: SocketAddr,
    _target_host: &str,
    _method: &[u8],
    _path: &[u8],
  ) -> Box<dyn Hijacker> {
    Box::new(NoopHijacker)
  }

  fn put(&self, _hijacker: Box<dyn Hijacker>) {}
}

pub(crate) static NOOP_HIJACKER_POOL: NoopHijackerPool = NoopHijackerPool;

/// Returns the hijacker to its pool when dropped, so every `get` is matched
/// by exactly one `put` no matter how the request ends.
pub(crate) struct PooledHijacker<'a> {
  pool: &'a dyn HijackerPool,
  hijacker: Option<Box<dyn Hijacker>>,
}

impl<'a> PooledHijacker<'a> {
  pub(crate) fn get(
    pool: &'a dyn HijackerPool,
    client_addr: SocketAddr,
    target_host: &str,
    method: &[u8],
    path: &[u8],
  ) -> Self {
    Self {
      pool,
      hijacker: Some(pool.get(client_addr, target_host, method, path)),
    }
  }

  pub(crate) fn as_mut(&mut self) -> &mut dyn Hijacker {
    match self.hijacker.as_mut() {
      Some(h) => h.as_mut(),
      // the option is only emptied in drop
      None => unreachable!("hijacker already returned"),
    }
  }
}

impl Drop for PooledHijacker<'_> {
  fn drop(&mut self) {
    if let Some(hijacker) = self.hijacker.take() {
      self.pool.put(hijacker);
    }
  }
}

/// A writer that duplicates everything into an optional observer.
///
/// Observer errors never fail the forward path: the first failure logs and
/// detaches the observer.
pub struct TeeWriter<W> {
  inner: W,
  observer: Option<BodyWriter>,
}

impl<W: AsyncWrite + Unpin> TeeWriter<W> {
  /// Wrap `inner`, optionally teeing into `observer`.
  pub fn new(inner: W, observer: Option<BodyWriter>) -> Self {
    Self { inner, observer }
  }

  /// Write to the forward path, then mirror into the observer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    self.inner.write_all(buf).await?;
    if let Some(observer) = &mut self.observer {
      if let Err(err) = observer.write_all(buf).await {
        debug!("body observer failed, detaching: {}", err);
        self.observer = None;
      }
    }
    Ok(())
  }

  /// Flush the forward path; the observer is flushed best-effort.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    self.inner.flush().await?;
    if let Some(observer) = &mut self.observer {
      if observer.flush().await.is_err() {
        self.observer = None;
      }
    }
    Ok(())
  }

  /// Unwrap the forward-path writer.
  pub fn into_inner(self) -> W {
    self.inner
  }
}
