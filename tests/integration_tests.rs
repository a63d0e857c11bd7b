//! Wire-level integration tests for the proxy engine.

use ambush::{
  Handler, Hijacker, HijackerPool, MitmAuthority, NoopHijacker, Proxy, ProxyKind, SuperProxy,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct SpliceHandler;

impl Handler for SpliceHandler {}

struct DecryptHandler;

impl Handler for DecryptHandler {
  fn should_decrypt_host(&self, _host_with_port: &str) -> bool {
    true
  }
}

struct ChainHandler {
  super_proxy: Arc<SuperProxy>,
}

impl Handler for ChainHandler {
  fn url_proxy(&self, _host_with_port: &str, _uri: &[u8]) -> Option<Arc<SuperProxy>> {
    Some(self.super_proxy.clone())
  }
}

async fn start_proxy(handler: Arc<dyn Handler>) -> SocketAddr {
  start_proxy_with(|builder| builder.handler(handler)).await
}

async fn start_proxy_with<F>(configure: F) -> SocketAddr
where
  F: FnOnce(ambush::ProxyBuilder) -> ambush::ProxyBuilder,
{
  let proxy = Arc::new(configure(Proxy::builder()).build().unwrap());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.serve(listener, Duration::from_secs(30)).await;
  });
  addr
}

/// Read until the end of an HTTP head (`\r\n\r\n`).
async fn read_head<R: AsyncReadExt + Unpin>(reader: &mut R) -> Vec<u8> {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = reader.read(&mut byte).await.unwrap();
    if n == 0 {
      break;
    }
    head.push(byte[0]);
  }
  head
}

/// A plain-HTTP origin that records each request head and answers with a
/// fixed body.
async fn start_origin(body: &'static str) -> (SocketAddr, Arc<tokio::sync::Mutex<Vec<Vec<u8>>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let heads = Arc::new(tokio::sync::Mutex::new(Vec::new()));
  let recorded = heads.clone();
  tokio::spawn(async move {
    loop {
      let (mut conn, _) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => return,
      };
      let recorded = recorded.clone();
      tokio::spawn(async move {
        loop {
          let head = read_head(&mut conn).await;
          if head.is_empty() {
            return;
          }
          recorded.lock().await.push(head);
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          if conn.write_all(response.as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, heads)
}

#[tokio::test]
async fn missing_host_gets_400() {
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn malformed_first_line_gets_400() {
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn.write_all(b"NOT A VALID REQUEST LINE\r\n").await.unwrap();
  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn forwards_plain_request_in_origin_form() {
  let (origin, heads) = start_origin("hello").await;
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://{origin}/path?q=1 HTTP/1.1\r\nHost: {origin}\r\n\r\n"
  );
  conn.write_all(request.as_bytes()).await.unwrap();

  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
  let mut body = [0u8; 5];
  conn.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"hello");

  let heads = heads.lock().await;
  assert_eq!(heads.len(), 1);
  // request-target rewritten to origin form, Host passed through
  assert!(heads[0].starts_with(b"GET /path?q=1 HTTP/1.1\r\n"));
  let head_text = String::from_utf8_lossy(&heads[0]);
  assert!(head_text.contains(&format!("Host: {origin}")));
}

#[tokio::test]
async fn keeps_connection_alive_across_requests() {
  let (origin, heads) = start_origin("ok").await;
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  for _ in 0..2 {
    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    conn.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut conn).await;
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let mut body = [0u8; 2];
    conn.read_exact(&mut body).await.unwrap();
  }
  assert_eq!(heads.lock().await.len(), 2);
}

#[tokio::test]
async fn connect_splices_bytes_opaquely() {
  // an origin speaking a non-HTTP protocol through the tunnel
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut conn, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();
  });

  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(format!("CONNECT {origin} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

  conn.write_all(b"ping").await.unwrap();
  let mut reply = [0u8; 4];
  conn.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply, b"pong");
}

#[tokio::test]
async fn connect_to_dead_upstream_gets_502() {
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  // port 1 on loopback refuses immediately
  conn
    .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn plain_dial_failure_gets_502_and_keeps_connection() {
  let (origin, _) = start_origin("ok").await;
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

  // the connection survives the failure
  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  conn.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn socks5_super_proxy_wire_format() {
  // fake SOCKS5 server that records the handshake, then plays origin
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let socks_addr = listener.local_addr().unwrap();
  let (tx, rx) = tokio::sync::oneshot::channel::<(Vec<u8>, Vec<u8>)>();
  tokio::spawn(async move {
    let (mut conn, _) = listener.accept().await.unwrap();

    let mut greeting = [0u8; 3];
    conn.read_exact(&mut greeting).await.unwrap();
    conn.write_all(&[0x05, 0x00]).await.unwrap();

    let mut request_head = [0u8; 4];
    conn.read_exact(&mut request_head).await.unwrap();
    let mut len = [0u8; 1];
    conn.read_exact(&mut len).await.unwrap();
    let mut rest = vec![0u8; len[0] as usize + 2];
    conn.read_exact(&mut rest).await.unwrap();
    let mut connect_request = request_head.to_vec();
    connect_request.push(len[0]);
    connect_request.extend_from_slice(&rest);
    // reply: succeeded, bound to 0.0.0.0:0
    conn
      .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
      .await
      .unwrap();
    tx.send((greeting.to_vec(), connect_request)).unwrap();

    // now act as the origin inside the tunnel
    let head = read_head(&mut conn).await;
    assert!(head.starts_with(b"GET / HTTP/1.1\r\n"));
    conn
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
  });

  let super_proxy = Arc::new(
    SuperProxy::new(
      "127.0.0.1",
      socks_addr.port(),
      ProxyKind::Socks5,
      "",
      "",
      false,
    )
    .unwrap(),
  );
  let proxy = start_proxy(Arc::new(ChainHandler { super_proxy })).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));

  let (greeting, connect_request) = rx.await.unwrap();
  assert_eq!(greeting, vec![0x05, 0x01, 0x00]);
  let mut expected = vec![0x05, 0x01, 0x00, 0x03, b"example.test".len() as u8];
  expected.extend_from_slice(b"example.test");
  expected.extend_from_slice(&80u16.to_be_bytes());
  assert_eq!(connect_request, expected);
}

#[tokio::test]
async fn http_connect_super_proxy_chains_tunnel() {
  // fake HTTP CONNECT proxy that records the CONNECT head, then echoes
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let chain_addr = listener.local_addr().unwrap();
  let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
  tokio::spawn(async move {
    let (mut conn, _) = listener.accept().await.unwrap();
    let head = read_head(&mut conn).await;
    conn
      .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
      .await
      .unwrap();
    tx.send(head).unwrap();

    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();
  });

  let super_proxy = Arc::new(
    SuperProxy::new(
      "127.0.0.1",
      chain_addr.port(),
      ProxyKind::Http,
      "user",
      "pass",
      false,
    )
    .unwrap(),
  );
  let proxy = start_proxy(Arc::new(ChainHandler { super_proxy })).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"CONNECT target.test:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

  conn.write_all(b"ping").await.unwrap();
  let mut reply = [0u8; 4];
  conn.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply, b"pong");

  let connect_head = String::from_utf8(rx.await.unwrap()).unwrap();
  assert!(connect_head.starts_with("CONNECT target.test:443 HTTP/1.1\r\n"));
  assert!(connect_head.contains("Host: target.test:443\r\n"));
  assert!(connect_head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

#[tokio::test]
async fn decrypted_connect_forwards_over_tls() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};
  use tokio_rustls::{TlsAcceptor, TlsConnector};

  let (cert_pem, key_pem) = MitmAuthority::generate_ca("ambush e2e CA").unwrap();
  let authority = Arc::new(MitmAuthority::from_pem(&cert_pem, &key_pem).unwrap());

  // a TLS origin presenting a certificate for 127.0.0.1 from the same CA
  let origin_config = authority.server_config("127.0.0.1").unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let acceptor = TlsAcceptor::from(origin_config);
    let (conn, _) = listener.accept().await.unwrap();
    let mut tls = acceptor.accept(conn).await.unwrap();
    let head = read_head(&mut tls).await;
    assert!(head.starts_with(b"GET /x HTTP/1.1\r\n"));
    tls
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nhello-tls")
      .await
      .unwrap();
    tls.flush().await.unwrap();
  });

  let ca_der = authority.ca_cert_der();
  let proxy = start_proxy_with(|builder| {
    builder
      .handler(Arc::new(DecryptHandler))
      .authority(authority)
      .upstream_root(ca_der.clone())
  })
  .await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(format!("CONNECT {origin} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

  // inside the tunnel the proxy speaks TLS with a leaf from our CA
  let mut roots = RootCertStore::empty();
  roots.add(ca_der).unwrap();
  let client_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(name, conn).await.unwrap();

  tls
    .write_all(format!("GET /x HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n").as_bytes())
    .await
    .unwrap();
  tls.flush().await.unwrap();
  let head = read_head(&mut tls).await;
  assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
  let mut body = [0u8; 9];
  tls.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"hello-tls");
}

struct SubstituteHijacker;

#[async_trait::async_trait]
impl Hijacker for SubstituteHijacker {
  async fn hijack_response(&mut self) -> Option<ambush::BodyReader> {
    let canned = b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 0\r\n\r\n".to_vec();
    Some(Box::new(std::io::Cursor::new(canned)))
  }
}

struct CountingHijackerPool {
  gets: AtomicUsize,
  puts: AtomicUsize,
  substitute: bool,
}

impl HijackerPool for CountingHijackerPool {
  fn get(
    &self,
    _client_addr: SocketAddr,
    _target_host: &str,
    _method: &[u8],
    _path: &[u8],
  ) -> Box<dyn Hijacker> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    if self.substitute {
      Box::new(SubstituteHijacker)
    } else {
      Box::new(NoopHijacker)
    }
  }

  fn put(&self, _hijacker: Box<dyn Hijacker>) {
    self.puts.fetch_add(1, Ordering::SeqCst);
  }
}

struct HijackingHandler {
  pool: CountingHijackerPool,
}

impl Handler for HijackingHandler {
  fn hijacker_pool(&self) -> &dyn HijackerPool {
    &self.pool
  }
}

#[tokio::test]
async fn hijacker_substitutes_response_without_upstream() {
  let handler = Arc::new(HijackingHandler {
    pool: CountingHijackerPool {
      gets: AtomicUsize::new(0),
      puts: AtomicUsize::new(0),
      substitute: true,
    },
  });
  let proxy = start_proxy(handler.clone()).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  // example.test resolves nowhere, which proves the upstream is never dialed
  conn
    .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 418 I'm a teapot\r\n"));

  assert_eq!(handler.pool.gets.load(Ordering::SeqCst), 1);
  assert_eq!(handler.pool.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hijacked_response_honors_connection_close() {
  let handler = Arc::new(HijackingHandler {
    pool: CountingHijackerPool {
      gets: AtomicUsize::new(0),
      puts: AtomicUsize::new(0),
      substitute: true,
    },
  });
  let proxy = start_proxy(handler).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  // read_to_end only returns because the proxy closes the connection
  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  assert!(response.starts_with(b"HTTP/1.1 418 I'm a teapot\r\n"));
}

#[tokio::test]
async fn dial_failure_with_connection_close_closes() {
  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  // the 502 must be the last thing on the wire before the close
  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  assert_eq!(response, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
}

#[tokio::test]
async fn hijacker_returned_to_pool_on_dial_failure() {
  let handler = Arc::new(HijackingHandler {
    pool: CountingHijackerPool {
      gets: AtomicUsize::new(0),
      puts: AtomicUsize::new(0),
      substitute: false,
    },
  });
  let proxy = start_proxy(handler.clone()).await;

  let mut conn = TcpStream::connect(proxy).await.unwrap();
  conn
    .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut conn).await;
  assert!(head.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

  assert_eq!(handler.pool.gets.load(Ordering::SeqCst), 1);
  assert_eq!(handler.pool.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chunked_response_is_relayed_verbatim() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut conn, _) = listener.accept().await.unwrap();
    let _ = read_head(&mut conn).await;
    conn
      .write_all(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
      )
      .await
      .unwrap();
  });

  let proxy = start_proxy(Arc::new(SpliceHandler)).await;
  let mut conn = TcpStream::connect(proxy).await.unwrap();
  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  conn.write_all(request.as_bytes()).await.unwrap();

  let mut response = Vec::new();
  conn.read_to_end(&mut response).await.unwrap();
  let text = String::from_utf8(response).unwrap();
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(text.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));
}
