//! Pooled buffered I/O.
//!
//! One process-wide pool hands out scratch buffers sized for HTTP headers and
//! builds the matching buffered readers. The pool grows without bound but
//! reuses aggressively; a released buffer keeps its capacity.

use std::sync::Mutex;
use tokio::io::{AsyncRead, BufReader};

/// Fixed buffer size; the largest single header line must fit.
pub const BUFFER_SIZE: usize = 4096;

/// A pool of `BUFFER_SIZE`-capacity byte buffers.
#[derive(Debug, Default)]
pub struct BufioPool {
  buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufioPool {
  /// Create an empty pool.
  pub fn new() -> Self {
    Self::default()
  }

  /// Take a cleared buffer with `BUFFER_SIZE` capacity.
  pub fn acquire(&self) -> Vec<u8> {
    let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
    buffers
      .pop()
      .unwrap_or_else(|| Vec::with_capacity(BUFFER_SIZE))
  }

  /// Return a buffer for reuse.
  pub fn release(&self, mut buffer: Vec<u8>) {
    buffer.clear();
    let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
    buffers.push(buffer);
  }

  /// Wrap a stream in a reader with the pool's buffer size. Writes pass
  /// through the reader to the underlying stream unbuffered.
  pub fn reader<R: AsyncRead>(&self, inner: R) -> BufReader<R> {
    BufReader::with_capacity(BUFFER_SIZE, inner)
  }
}
