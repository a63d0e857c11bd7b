//! Response-line parsing.

use crate::errors::{Error, Result};
use crate::header::read_limited_line;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncBufRead;

/// A parsed `HTTP-VERSION SP STATUS-CODE SP REASON CRLF` line, raw bytes kept.
#[derive(Debug, Default)]
pub struct ResponseLine {
  raw: Bytes,
  protocol: Vec<u8>,
  status_code: u16,
  reason: Vec<u8>,
}

impl ResponseLine {
  /// Read one response line off the upstream reader.
  pub async fn read_from<R>(
    reader: &mut R,
    read_timeout: Option<Duration>,
  ) -> Result<ResponseLine>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut raw = Vec::new();
    let n = read_limited_line(reader, &mut raw, read_timeout).await?;
    if n == 0 {
      return Err(Error::UnexpectedEof);
    }
    let line = strip_line_ending(&raw);
    let mut parts = line.splitn(3, |b| *b == b' ');
    let protocol = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();
    if !protocol.starts_with(b"HTTP/") {
      return Err(Error::MalformedLine("response line"));
    }
    if status.len() != 3 || !status.iter().all(|b| b.is_ascii_digit()) {
      return Err(Error::MalformedLine("response line"));
    }
    let status_code = status
      .iter()
      .fold(0u16, |code, b| code * 10 + (b - b'0') as u16);
    Ok(ResponseLine {
      protocol: protocol.to_vec(),
      status_code,
      reason: reason.to_vec(),
      raw: Bytes::from(raw),
    })
  }

  /// The raw response line including the trailing CRLF.
  pub fn raw(&self) -> &[u8] {
    &self.raw
  }

  /// The protocol token, e.g. `HTTP/1.1`.
  pub fn protocol(&self) -> &[u8] {
    &self.protocol
  }

  /// The 3-digit status code.
  pub fn status_code(&self) -> u16 {
    self.status_code
  }

  /// The reason phrase; may be empty.
  pub fn reason(&self) -> &[u8] {
    &self.reason
  }

  /// True for `HTTP/1.0` responses.
  pub fn is_http10(&self) -> bool {
    self.protocol == b"HTTP/1.0"
  }

  /// True when the status forbids a body (1xx, 204, 304).
  pub fn is_bodyless(&self) -> bool {
    (100..200).contains(&self.status_code) || self.status_code == 204 || self.status_code == 304
  }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}
