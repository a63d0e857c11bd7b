//! # ambush
//!
//! An HTTP/HTTPS forward proxy library with selective TLS interception.
//!
//! The proxy sits between clients and origins, optionally chaining through an
//! upstream super proxy (HTTP, HTTPS or SOCKS5). For CONNECT tunnels the
//! operator decides per destination whether bytes are spliced opaquely or TLS
//! is terminated locally with a dynamically issued leaf certificate, letting a
//! per-request [`Hijacker`] observe and rewrite the inner exchange.
//!
//! # Example
//!
//! ```no_run
//! use ambush::{MitmAuthority, Proxy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let (cert_pem, key_pem) = MitmAuthority::generate_ca("my proxy CA")?;
//!   let authority = Arc::new(MitmAuthority::from_pem(&cert_pem, &key_pem)?);
//!
//!   let proxy = Proxy::builder().authority(authority).build()?;
//!   let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!   proxy.serve(listener, Duration::from_secs(30)).await?;
//!   Ok(())
//! }
//! ```

mod bufpool;
mod ca;
mod dialer;
mod errors;
mod handler;
mod header;
mod hijack;
mod proxy;
mod request;
mod response;
mod server;
mod stream;
mod superproxy;
mod uri;

pub use bufpool::{BufioPool, BUFFER_SIZE};
pub use ca::{upstream_client_config, IssuedCert, MitmAuthority};
pub use dialer::{dialer, Dialer, DEFAULT_DIAL_TIMEOUT, DNS_CACHE_DURATION};
pub use errors::{Error, Result};
pub use handler::{DirectHandler, Handler};
pub use header::Header;
pub use hijack::{BodyReader, BodyWriter, Hijacker, HijackerPool, NoopHijacker, NoopHijackerPool, TeeWriter};
pub use request::RequestLine;
pub use response::ResponseLine;
pub use server::{Proxy, ProxyBuilder};
pub use stream::MaybeTlsStream;
pub use superproxy::{ProxyKind, SuperProxy};
pub use uri::{HostInfo, Uri};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
