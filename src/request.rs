//! Request-line parsing.

use crate::errors::{Error, Result};
use crate::header::read_limited_line;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncBufRead;

/// A parsed `METHOD SP REQUEST-TARGET SP HTTP-VERSION CRLF` line.
///
/// The raw bytes including the trailing CRLF are preserved; the request-target
/// is kept verbatim for [`crate::uri::Uri::parse`].
#[derive(Debug, Default)]
pub struct RequestLine {
  raw: Bytes,
  method: Vec<u8>,
  request_target: Vec<u8>,
  protocol: Vec<u8>,
}

impl RequestLine {
  /// Read one request line. `Ok(None)` means the peer closed cleanly before
  /// sending anything.
  pub async fn read_from<R>(
    reader: &mut R,
    read_timeout: Option<Duration>,
  ) -> Result<Option<RequestLine>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut raw = Vec::new();
    let n = read_limited_line(reader, &mut raw, read_timeout).await?;
    if n == 0 {
      return Ok(None);
    }
    let line = strip_line_ending(&raw);
    let mut parts = line.splitn(3, |b| *b == b' ');
    let method = parts.next().unwrap_or_default();
    let request_target = parts.next().unwrap_or_default();
    let protocol = parts.next().unwrap_or_default();
    if method.is_empty() || request_target.is_empty() || !is_token(method) {
      return Err(Error::MalformedLine("request line"));
    }
    if !protocol.starts_with(b"HTTP/") {
      return Err(Error::MalformedLine("request line"));
    }
    Ok(Some(RequestLine {
      method: method.to_vec(),
      request_target: request_target.to_vec(),
      protocol: protocol.to_vec(),
      raw: Bytes::from(raw),
    }))
  }

  /// The raw request line including the trailing CRLF.
  pub fn raw(&self) -> &[u8] {
    &self.raw
  }

  /// The method token.
  pub fn method(&self) -> &[u8] {
    &self.method
  }

  /// The request-target, verbatim.
  pub fn request_target(&self) -> &[u8] {
    &self.request_target
  }

  /// The protocol token, e.g. `HTTP/1.1`.
  pub fn protocol(&self) -> &[u8] {
    &self.protocol
  }

  /// True for `CONNECT` requests.
  pub fn is_connect(&self) -> bool {
    self.method == b"CONNECT"
  }

  /// True for `HTTP/1.0`, which defaults to close unless keep-alive is asked for.
  pub fn is_http10(&self) -> bool {
    self.protocol == b"HTTP/1.0"
  }

  /// True for `HEAD`, whose responses carry no body.
  pub fn is_head(&self) -> bool {
    self.method.eq_ignore_ascii_case(b"HEAD")
  }
}

fn is_token(bytes: &[u8]) -> bool {
  bytes.iter().all(|b| {
    b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
        | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
  })
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}
