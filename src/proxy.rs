//! Per-connection request engine.
//!
//! Each accepted connection runs the same cycle: parse the request line,
//! consult policy, then forward plain HTTP, splice a CONNECT tunnel, or
//! terminate TLS locally and re-enter the cycle on the decrypted stream.
//! Within one connection requests are strictly sequential; request N+1 is not
//! read before response N has been fully written.

use crate::bufpool::{BufioPool, BUFFER_SIZE};
use crate::ca::MitmAuthority;
use crate::dialer::dialer;
use crate::errors::{new_io_error, Error, Result};
use crate::handler::Handler;
use crate::header::{read_limited_line, Header};
use crate::hijack::{PooledHijacker, TeeWriter};
use crate::request::RequestLine;
use crate::response::ResponseLine;
use crate::stream::MaybeTlsStream;
use crate::superproxy::{ProxyKind, SuperProxy};
use crate::uri::{HostInfo, Uri};
use crate::{CR_LF, SPACE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info};

pub(crate) const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub(crate) const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub(crate) const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Shared per-server state the engine runs against.
pub(crate) struct Engine {
  pub(crate) handler: Arc<dyn Handler>,
  pub(crate) authority: Option<Arc<MitmAuthority>>,
  pub(crate) pool: Arc<BufioPool>,
  pub(crate) dial_timeout: Duration,
  pub(crate) read_timeout: Option<Duration>,
  pub(crate) upstream_tls: TlsConnector,
}

impl Engine {
  /// Drive one accepted client connection to completion.
  pub(crate) async fn handle_connection(self: Arc<Self>, stream: TcpStream, client_addr: SocketAddr) {
    let mut client = self.pool.reader(stream);
    loop {
      let request_line = match RequestLine::read_from(&mut client, self.read_timeout).await {
        Ok(Some(line)) => line,
        // clean close between requests
        Ok(None) => return,
        Err(err) => {
          if err.is_client_protocol() && !matches!(err, Error::UnexpectedEof) {
            let _ = write_flush(&mut client, RESPONSE_400).await;
          }
          return;
        }
      };

      if request_line.is_connect() {
        // a CONNECT consumes the rest of the connection either way
        self.handle_connect(client, client_addr, request_line).await;
        return;
      }

      match self
        .forward_request(&mut client, client_addr, &request_line, None)
        .await
      {
        Ok(true) => continue,
        Ok(false) => return,
        Err(err) => {
          error!("{} request failed: {}", client_addr, err);
          return;
        }
      }
    }
  }

  async fn handle_connect(
    &self,
    mut client: BufReader<TcpStream>,
    client_addr: SocketAddr,
    request_line: RequestLine,
  ) {
    // the CONNECT header block carries nothing the tunnel needs
    if let Err(err) = Header::read_from(&mut client, self.read_timeout).await {
      if err.is_client_protocol() {
        let _ = write_flush(&mut client, RESPONSE_400).await;
      }
      return;
    }

    let mut uri = Uri::default();
    uri.parse(true, request_line.request_target());
    let host_with_port = uri.host_info().host_with_port().to_string();
    if host_with_port.is_empty() {
      let _ = write_flush(&mut client, RESPONSE_400).await;
      return;
    }

    let super_proxy = self.handler.url_proxy(&host_with_port, b"");
    if self.handler.should_decrypt_host(&host_with_port) {
      if let Some(authority) = self.authority.clone() {
        self
          .decrypt_tunnel(client, client_addr, uri, authority)
          .await;
        return;
      }
      debug!("no CA configured, splicing {} instead", host_with_port);
    }
    self
      .splice_tunnel(client, client_addr, &uri, super_proxy.as_deref())
      .await;
  }

  /// Opaque CONNECT tunnel: reply 200, then pump bytes until either side closes.
  async fn splice_tunnel(
    &self,
    mut client: BufReader<TcpStream>,
    client_addr: SocketAddr,
    uri: &Uri,
    super_proxy: Option<&SuperProxy>,
  ) {
    let target = uri.host_info().target_with_port();
    let mut upstream = match self.dial_tunnel(target, super_proxy).await {
      Ok(upstream) => upstream,
      Err(err) => {
        error!("{} CONNECT {} failed: {}", client_addr, target, err);
        let _ = write_flush(&mut client, RESPONSE_502).await;
        return;
      }
    };
    if write_flush(&mut client, RESPONSE_200_CONNECT).await.is_err() {
      return;
    }
    info!("{} CONNECT {} spliced", client_addr, target);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
      Ok((up, down)) => debug!("{} tunnel closed, {}B up {}B down", client_addr, up, down),
      Err(err) => debug!("{} tunnel aborted: {}", client_addr, err),
    }
  }

  /// MITM: reply 200, terminate TLS with an issued leaf, then serve the
  /// decrypted requests like plain ones, re-encrypting upstream.
  async fn decrypt_tunnel(
    &self,
    mut client: BufReader<TcpStream>,
    client_addr: SocketAddr,
    uri: Uri,
    authority: Arc<MitmAuthority>,
  ) {
    let origin = uri.host_info().clone();
    let server_config = match authority.server_config(origin.domain()) {
      Ok(config) => config,
      Err(err) => {
        error!("{} leaf issuance for {} failed: {}", client_addr, origin.domain(), err);
        let _ = write_flush(&mut client, RESPONSE_502).await;
        return;
      }
    };
    if write_flush(&mut client, RESPONSE_200_CONNECT).await.is_err() {
      return;
    }
    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = match acceptor.accept(client).await {
      Ok(stream) => stream,
      Err(err) => {
        debug!("{} TLS accept for {} failed: {}", client_addr, origin.domain(), err);
        return;
      }
    };

    let mut decrypted = self.pool.reader(tls_stream);
    loop {
      let request_line = match RequestLine::read_from(&mut decrypted, self.read_timeout).await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(err) => {
          if err.is_client_protocol() && !matches!(err, Error::UnexpectedEof) {
            let _ = write_flush(&mut decrypted, RESPONSE_400).await;
          }
          return;
        }
      };
      if request_line.is_connect() {
        let _ = write_flush(&mut decrypted, RESPONSE_400).await;
        return;
      }
      match self
        .forward_request(&mut decrypted, client_addr, &request_line, Some(&origin))
        .await
      {
        Ok(true) => continue,
        Ok(false) => return,
        Err(err) => {
          error!("{} decrypted request failed: {}", client_addr, err);
          return;
        }
      }
    }
  }

  /// Forward one plain (or decrypted) request. Returns whether the client
  /// connection survives for the next request.
  async fn forward_request<C>(
    &self,
    client: &mut C,
    client_addr: SocketAddr,
    request_line: &RequestLine,
    origin: Option<&HostInfo>,
  ) -> Result<bool>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    let mut uri = Uri::default();
    uri.parse(false, request_line.request_target());

    let request_header = match Header::read_from(client, self.read_timeout).await {
      Ok(header) => header,
      Err(err) if err.is_client_protocol() => {
        let _ = write_flush(client, RESPONSE_400).await;
        return Ok(false);
      }
      Err(err) => return Err(err),
    };

    // route by the target host: the CONNECT origin after decryption, the
    // absolute-form authority, or the Host header for origin-form requests
    let route = match self.route_target(&uri, &request_header, origin) {
      Some(route) => route,
      None => {
        let _ = write_flush(client, RESPONSE_400).await;
        return Ok(false);
      }
    };

    let mut hijacker = PooledHijacker::get(
      self.handler.hijacker_pool(),
      client_addr,
      &route.host_with_port,
      request_line.method(),
      uri.path(),
    );
    let request_tee = hijacker
      .as_mut()
      .on_request(&request_header, request_header.raw())
      .await;

    if let Some(mut substitute) = hijacker.as_mut().hijack_response().await {
      // keep the connection in sync: consume the request body even though
      // the upstream is never contacted
      let mut sink = TeeWriter::new(tokio::io::sink(), request_tee);
      self.copy_request_body(client, &mut sink, &request_header).await?;
      tokio::io::copy(&mut substitute, client).await?;
      client.flush().await?;
      info!(
        "{} {} {} hijacked",
        client_addr,
        String::from_utf8_lossy(request_line.method()),
        route.host_with_port
      );
      let keep =
        !request_header.connection_close() && client_keep_alive(request_line, &request_header);
      return Ok(keep);
    }

    let super_proxy = self.handler.url_proxy(&route.host_with_port, uri.full());
    let upstream = match self
      .open_upstream(&route, origin, super_proxy.as_deref())
      .await
    {
      Ok(upstream) => upstream,
      Err(err) => {
        error!("{} dial {} failed: {}", client_addr, route.target_with_port, err);
        write_flush(client, RESPONSE_502).await?;
        // a pending request body would desync the stream, so only bodyless
        // requests that did not ask to close survive the failure
        let keep = request_header.content_length() <= 0
          && !request_header.is_chunked()
          && !request_header.connection_close()
          && client_keep_alive(request_line, &request_header);
        return Ok(keep);
      }
    };
    let mut upstream = self.pool.reader(upstream);

    // request head: origin form unless relayed to an HTTP proxy hop
    let absolute_form = origin.is_none()
      && matches!(
        super_proxy.as_deref().map(SuperProxy::kind),
        Some(ProxyKind::Http) | Some(ProxyKind::Https)
      );
    let mut head = self.pool.acquire();
    head.extend_from_slice(request_line.method());
    head.extend_from_slice(SPACE);
    if absolute_form {
      head.extend_from_slice(uri.full());
    } else {
      let target = uri.path_with_query_fragment();
      head.extend_from_slice(if target.is_empty() { b"/".as_slice() } else { target });
    }
    head.extend_from_slice(SPACE);
    head.extend_from_slice(request_line.protocol());
    head.extend_from_slice(CR_LF);
    if !request_header.contains("host") {
      head.extend_from_slice(b"Host: ");
      head.extend_from_slice(route.host_with_port.as_bytes());
      head.extend_from_slice(CR_LF);
    }
    if absolute_form {
      if let Some(auth) = super_proxy.as_deref().and_then(SuperProxy::basic_auth) {
        head.extend_from_slice(b"Proxy-Authorization: ");
        head.extend_from_slice(auth.as_bytes());
        head.extend_from_slice(CR_LF);
      }
    }
    upstream.write_all(&head).await?;
    self.pool.release(head);
    // the raw block keeps its terminating empty line
    upstream.write_all(request_header.raw()).await?;

    let mut to_upstream = TeeWriter::new(&mut upstream, request_tee);
    self
      .copy_request_body(client, &mut to_upstream, &request_header)
      .await?;
    to_upstream.flush().await?;

    // response head
    let response_line = ResponseLine::read_from(&mut upstream, self.read_timeout).await?;
    let response_header = Header::read_from(&mut upstream, self.read_timeout).await?;
    let response_tee = hijacker
      .as_mut()
      .on_response(&response_line, &response_header, response_header.raw())
      .await;

    client.write_all(response_line.raw()).await?;
    client.write_all(response_header.raw()).await?;

    if response_line.status_code() == 101 {
      // the protocol switched; the rest of the connection is an opaque tunnel
      client.flush().await?;
      let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;
      info!(
        "{} {} {} -> 101 upgraded",
        client_addr,
        String::from_utf8_lossy(request_line.method()),
        route.host_with_port
      );
      return Ok(false);
    }

    let mut close_delimited = false;
    {
      let mut to_client = TeeWriter::new(&mut *client, response_tee);
      if request_line.is_head() || response_line.is_bodyless() {
        // no body by definition
      } else if response_header.is_chunked() {
        self.copy_chunked_body(&mut upstream, &mut to_client).await?;
      } else if response_header.content_length() >= 0 {
        self
          .copy_sized_body(&mut upstream, &mut to_client, response_header.content_length() as u64)
          .await?;
      } else {
        close_delimited = true;
        self.copy_until_eof(&mut upstream, &mut to_client).await?;
      }
      to_client.flush().await?;
    }
    client.flush().await?;

    info!(
      "{} {} {} -> {}",
      client_addr,
      String::from_utf8_lossy(request_line.method()),
      route.host_with_port,
      response_line.status_code()
    );

    let keep = !close_delimited
      && !request_header.connection_close()
      && !response_header.connection_close()
      && client_keep_alive(request_line, &request_header);
    Ok(keep)
  }

  fn route_target(
    &self,
    uri: &Uri,
    request_header: &Header,
    origin: Option<&HostInfo>,
  ) -> Option<RouteTarget> {
    if let Some(origin) = origin {
      return Some(RouteTarget {
        host_with_port: origin.host_with_port().to_string(),
        target_with_port: origin.target_with_port().to_string(),
        domain: origin.domain().to_string(),
      });
    }
    let from_info = |info: &HostInfo| RouteTarget {
      host_with_port: info.host_with_port().to_string(),
      target_with_port: info.target_with_port().to_string(),
      domain: info.domain().to_string(),
    };
    if !uri.host().is_empty() && !uri.host_info().host_with_port().is_empty() {
      return Some(from_info(uri.host_info()));
    }
    let host = request_header.get("host")?;
    let mut info = HostInfo::default();
    info.parse_host_with_port(&String::from_utf8_lossy(host), false);
    if info.host_with_port().is_empty() {
      return None;
    }
    Some(from_info(&info))
  }

  /// Open the upstream stream for a plain or decrypted request.
  async fn open_upstream(
    &self,
    route: &RouteTarget,
    origin: Option<&HostInfo>,
    super_proxy: Option<&SuperProxy>,
  ) -> Result<MaybeTlsStream> {
    if origin.is_some() {
      // decrypted request: reach the origin through a tunnel, then re-encrypt
      let stream = self.dial_tunnel(&route.target_with_port, super_proxy).await?;
      let name = ServerName::try_from(route.domain.clone())
        .map_err(|e| Error::Other(format!("invalid SNI name: {}", e)))?;
      let tls_stream = self.upstream_tls.connect(name, stream).await?;
      return Ok(MaybeTlsStream::from(tls_stream));
    }
    match super_proxy {
      Some(sp) => match sp.kind() {
        // HTTP proxies take the request in absolute form on the main stream
        ProxyKind::Http | ProxyKind::Https => sp.open(self.dial_timeout).await,
        ProxyKind::Socks5 => sp.tunnel(&route.target_with_port, self.dial_timeout).await,
      },
      None => {
        let conn = dialer().dial(&route.target_with_port, self.dial_timeout).await?;
        Ok(MaybeTlsStream::from(conn))
      }
    }
  }

  async fn dial_tunnel(
    &self,
    target_with_port: &str,
    super_proxy: Option<&SuperProxy>,
  ) -> Result<MaybeTlsStream> {
    match super_proxy {
      Some(sp) => sp.tunnel(target_with_port, self.dial_timeout).await,
      None => {
        let conn = dialer().dial(target_with_port, self.dial_timeout).await?;
        Ok(MaybeTlsStream::from(conn))
      }
    }
  }

  /// Copy the request body client → upstream per its framing. Requests
  /// without framing headers carry no body.
  async fn copy_request_body<R, W>(
    &self,
    client: &mut R,
    to_upstream: &mut TeeWriter<W>,
    header: &Header,
  ) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    if header.is_chunked() {
      self.copy_chunked_body(client, to_upstream).await
    } else if header.content_length() > 0 {
      self
        .copy_sized_body(client, to_upstream, header.content_length() as u64)
        .await
    } else {
      Ok(())
    }
  }

  async fn copy_sized_body<R, W>(
    &self,
    reader: &mut R,
    writer: &mut TeeWriter<W>,
    length: u64,
  ) -> Result<()>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut buf = self.pool.acquire();
    buf.resize(BUFFER_SIZE, 0);
    let result = self.copy_sized_inner(reader, writer, length, &mut buf).await;
    self.pool.release(buf);
    result
  }

  async fn copy_sized_inner<R, W>(
    &self,
    reader: &mut R,
    writer: &mut TeeWriter<W>,
    mut remaining: u64,
    buf: &mut [u8],
  ) -> Result<()>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    while remaining > 0 {
      let want = remaining.min(buf.len() as u64) as usize;
      let n = self.timed_read(reader, &mut buf[..want]).await?;
      if n == 0 {
        return Err(Error::UnexpectedEof);
      }
      writer.write_all(&buf[..n]).await?;
      remaining -= n as u64;
    }
    Ok(())
  }

  /// Copy a chunked body verbatim, chunk size lines and trailers included.
  async fn copy_chunked_body<R, W>(&self, reader: &mut R, writer: &mut TeeWriter<W>) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut buf = self.pool.acquire();
    buf.resize(BUFFER_SIZE, 0);
    let result = self.copy_chunked_inner(reader, writer, &mut buf).await;
    self.pool.release(buf);
    result
  }

  async fn copy_chunked_inner<R, W>(
    &self,
    reader: &mut R,
    writer: &mut TeeWriter<W>,
    buf: &mut [u8],
  ) -> Result<()>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    loop {
      let mut line = Vec::new();
      let n = read_limited_line(reader, &mut line, self.read_timeout).await?;
      if n == 0 {
        return Err(Error::UnexpectedEof);
      }
      let size = parse_chunk_size(&line)?;
      writer.write_all(&line).await?;
      if size == 0 {
        break;
      }
      self.copy_sized_inner(reader, writer, size, buf).await?;
      line.clear();
      let n = read_limited_line(reader, &mut line, self.read_timeout).await?;
      if n == 0 {
        return Err(Error::UnexpectedEof);
      }
      writer.write_all(&line).await?;
    }
    // trailer section runs to the empty line
    loop {
      let mut line = Vec::new();
      let n = read_limited_line(reader, &mut line, self.read_timeout).await?;
      if n == 0 {
        return Err(Error::UnexpectedEof);
      }
      writer.write_all(&line).await?;
      if line == b"\r\n" || line == b"\n" {
        break;
      }
    }
    Ok(())
  }

  async fn copy_until_eof<R, W>(&self, reader: &mut R, writer: &mut TeeWriter<W>) -> Result<()>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut buf = self.pool.acquire();
    buf.resize(BUFFER_SIZE, 0);
    let result = loop {
      match self.timed_read(reader, &mut buf).await {
        Ok(0) => break Ok(()),
        Ok(n) => {
          if let Err(err) = writer.write_all(&buf[..n]).await {
            break Err(Error::Io(err));
          }
        }
        Err(err) => break Err(err),
      }
    };
    self.pool.release(buf);
    result
  }

  async fn timed_read<R: AsyncRead + Unpin>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    match self.read_timeout {
      Some(t) => tokio::time::timeout(t, reader.read(buf))
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "read timed out"))?
        .map_err(Error::Io),
      None => reader.read(buf).await.map_err(Error::Io),
    }
  }
}

struct RouteTarget {
  host_with_port: String,
  target_with_port: String,
  domain: String,
}

fn client_keep_alive(request_line: &RequestLine, header: &Header) -> bool {
  if request_line.is_http10() {
    header.connection_keep_alive()
  } else {
    true
  }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let line = {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
  };
  let digits = line
    .split(|b| *b == b';')
    .next()
    .unwrap_or_default();
  let text =
    std::str::from_utf8(digits).map_err(|_| Error::MalformedLine("chunk size"))?;
  u64::from_str_radix(text.trim(), 16).map_err(|_| Error::MalformedLine("chunk size"))
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
  writer.write_all(bytes).await?;
  writer.flush().await?;
  Ok(())
}
