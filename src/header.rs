//! HTTP/1.x header block parsing.
//!
//! Headers are kept as an ordered sequence of raw (name, value) byte pairs and
//! the untouched raw span (terminating empty line included) is preserved so a
//! forwarded message can be replayed byte for byte. While scanning, the framing
//! fields the engine needs are derived: `content_length`, `is_chunked` and
//! `connection_close`.

use crate::bufpool::BUFFER_SIZE;
use crate::errors::{new_io_error, Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Read one header line (including the trailing `\n`) into `buf`.
///
/// Returns the number of bytes appended; 0 means the peer closed cleanly at a
/// line boundary. A line longer than [`BUFFER_SIZE`] is rejected rather than
/// buffered.
pub(crate) async fn read_limited_line<R>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  read_timeout: Option<Duration>,
) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let mut limited = (&mut *reader).take((BUFFER_SIZE + 1) as u64);
  let n = match read_timeout {
    Some(t) => tokio::time::timeout(t, limited.read_until(b'\n', buf))
      .await
      .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "read timed out"))??,
    None => limited.read_until(b'\n', buf).await?,
  };
  if n > BUFFER_SIZE {
    return Err(Error::HeaderTooLarge(BUFFER_SIZE));
  }
  if n > 0 && buf[buf.len() - 1] != b'\n' {
    return Err(Error::UnexpectedEof);
  }
  Ok(n)
}

/// An ordered header block plus the framing fields derived while scanning it.
#[derive(Debug, Default)]
pub struct Header {
  fields: Vec<(Vec<u8>, Vec<u8>)>,
  raw: Vec<u8>,
  content_length: i64,
  is_chunked: bool,
  connection_close: bool,
  connection_keep_alive: bool,
}

impl Header {
  /// Parse a header block off `reader` until the empty CRLF line.
  pub async fn read_from<R>(reader: &mut R, read_timeout: Option<Duration>) -> Result<Header>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut header = Header {
      content_length: -1,
      ..Header::default()
    };
    loop {
      let line_start = header.raw.len();
      let n = read_limited_line(reader, &mut header.raw, read_timeout).await?;
      if n == 0 {
        return Err(Error::UnexpectedEof);
      }
      let line = &header.raw[line_start..];
      if line == b"\r\n" || line == b"\n" {
        break;
      }
      let line = strip_line_ending(line);
      let colon = match line.iter().position(|b| *b == b':') {
        Some(i) => i,
        None => return Err(Error::MalformedLine("header line")),
      };
      let name = line[..colon].to_vec();
      if name.is_empty() {
        return Err(Error::MalformedLine("header line"));
      }
      let value = strip_leading_ows(&line[colon + 1..]).to_vec();
      header.scan_field(&name, &value)?;
      header.fields.push((name, value));
    }
    // chunked framing wins over a Content-Length header
    if header.is_chunked {
      header.content_length = -1;
    }
    Ok(header)
  }

  fn scan_field(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
    if name.eq_ignore_ascii_case(b"content-length") {
      self.content_length = parse_content_length(value)?;
    } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
      if has_token(value, b"chunked") {
        self.is_chunked = true;
      }
    } else if name.eq_ignore_ascii_case(b"connection") {
      if has_token(value, b"close") {
        self.connection_close = true;
      }
      if has_token(value, b"keep-alive") {
        self.connection_keep_alive = true;
      }
    }
    Ok(())
  }

  /// The raw header span, terminating empty line included.
  pub fn raw(&self) -> &[u8] {
    &self.raw
  }

  /// Ordered (name, value) pairs as received.
  pub fn fields(&self) -> &[(Vec<u8>, Vec<u8>)] {
    &self.fields
  }

  /// First value of a field, matched case-insensitively.
  pub fn get(&self, name: &str) -> Option<&[u8]> {
    self
      .fields
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
      .map(|(_, v)| v.as_slice())
  }

  /// True when the field is present.
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Declared body length; -1 when unknown or superseded by chunked framing.
  pub fn content_length(&self) -> i64 {
    self.content_length
  }

  /// True when `Transfer-Encoding: chunked` was seen.
  pub fn is_chunked(&self) -> bool {
    self.is_chunked
  }

  /// True when `Connection: close` was seen.
  pub fn connection_close(&self) -> bool {
    self.connection_close
  }

  /// True when `Connection: keep-alive` was seen (HTTP/1.0 opt-in).
  pub fn connection_keep_alive(&self) -> bool {
    self.connection_keep_alive
  }
}

fn parse_content_length(value: &[u8]) -> Result<i64> {
  if value.is_empty() {
    return Err(Error::MalformedLine("Content-Length value"));
  }
  let mut length: i64 = 0;
  for b in value {
    if !b.is_ascii_digit() {
      return Err(Error::MalformedLine("Content-Length value"));
    }
    length = length
      .checked_mul(10)
      .and_then(|l| l.checked_add((b - b'0') as i64))
      .ok_or(Error::MalformedLine("Content-Length value"))?;
  }
  Ok(length)
}

fn has_token(value: &[u8], token: &[u8]) -> bool {
  value
    .split(|b| *b == b',')
    .any(|part| trim_ows(part).eq_ignore_ascii_case(token))
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn strip_leading_ows(value: &[u8]) -> &[u8] {
  let mut value = value;
  while let [b' ' | b'\t', rest @ ..] = value {
    value = rest;
  }
  value
}

fn trim_ows(value: &[u8]) -> &[u8] {
  let mut value = strip_leading_ows(value);
  while let [rest @ .., b' ' | b'\t'] = value {
    value = rest;
  }
  value
}
