//! engine error

use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `ambush::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// I/O error on a client or upstream stream
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// a single header line does not fit the pooled buffer
  #[error("header line exceeds the {0} byte buffer")]
  HeaderTooLarge(usize),
  /// request line, response line or header line failed to parse
  #[error("malformed {0}")]
  MalformedLine(&'static str),
  /// the peer closed mid-message
  #[error("unexpected end of stream")]
  UnexpectedEof,
  /// dialing to the given TCP address timed out
  #[error("dialing to the given TCP address timed out")]
  DialTimeout,
  /// DNS resolution failed or produced no entries
  #[error("dns lookup failed: {0}")]
  Dns(String),
  /// the super proxy refused the tunnel; carries the HTTP status or SOCKS5 reply code
  #[error("super proxy refused the tunnel: {0}")]
  SuperProxyRefused(u16),
  /// CA loading or leaf issuance failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// super proxy descriptor could not be built
  #[error("invalid super proxy: {0}")]
  Proxy(String),
  /// unknown error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error
  pub fn certificate<E: std::fmt::Display>(e: E) -> Self {
    Error::Certificate(e.to_string())
  }

  /// Create an invalid super proxy error
  pub fn proxy<E: std::fmt::Display>(e: E) -> Self {
    Error::Proxy(e.to_string())
  }

  /// True when the error is a client protocol error that warrants a 400 reply
  pub fn is_client_protocol(&self) -> bool {
    matches!(
      self,
      Error::HeaderTooLarge(_) | Error::MalformedLine(_) | Error::UnexpectedEof
    )
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
