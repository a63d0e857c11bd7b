//! Accept loop and server lifecycle.

use crate::bufpool::BufioPool;
use crate::ca::{self, MitmAuthority};
use crate::dialer::DEFAULT_DIAL_TIMEOUT;
use crate::errors::Result;
use crate::handler::{DirectHandler, Handler};
use crate::proxy::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

/// The proxy server: policy, interception machinery and the accept loop.
pub struct Proxy {
  handler: Arc<dyn Handler>,
  authority: Option<Arc<MitmAuthority>>,
  pool: Arc<BufioPool>,
  dial_timeout: Duration,
  upstream_tls: TlsConnector,
  shutdown: watch::Sender<bool>,
}

/// Builder for [`Proxy`].
pub struct ProxyBuilder {
  handler: Arc<dyn Handler>,
  authority: Option<Arc<MitmAuthority>>,
  dial_timeout: Duration,
  upstream_roots: Vec<CertificateDer<'static>>,
  insecure_upstream: bool,
}

impl Default for ProxyBuilder {
  fn default() -> Self {
    Self {
      handler: Arc::new(DirectHandler),
      authority: None,
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
      upstream_roots: Vec::new(),
      insecure_upstream: false,
    }
  }
}

impl ProxyBuilder {
  /// Set the policy handler.
  pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
    self.handler = handler;
    self
  }

  /// Enable TLS interception with the given authority. Without one, CONNECT
  /// tunnels are always spliced.
  pub fn authority(mut self, authority: Arc<MitmAuthority>) -> Self {
    self.authority = Some(authority);
    self
  }

  /// Timeout for upstream dials; defaults to 5 seconds.
  pub fn dial_timeout(mut self, timeout: Duration) -> Self {
    self.dial_timeout = timeout;
    self
  }

  /// Add a trusted root for proxy-originated upstream TLS.
  pub fn upstream_root(mut self, root: CertificateDer<'static>) -> Self {
    self.upstream_roots.push(root);
    self
  }

  /// Skip verification of upstream certificates after interception.
  pub fn insecure_upstream(mut self, insecure: bool) -> Self {
    self.insecure_upstream = insecure;
    self
  }

  /// Build the proxy.
  pub fn build(self) -> Result<Proxy> {
    let upstream_config =
      ca::upstream_client_config(&self.upstream_roots, self.insecure_upstream)?;
    let (shutdown, _) = watch::channel(false);
    Ok(Proxy {
      handler: self.handler,
      authority: self.authority,
      pool: Arc::new(BufioPool::new()),
      dial_timeout: self.dial_timeout,
      upstream_tls: TlsConnector::from(Arc::new(upstream_config)),
      shutdown,
    })
  }
}

impl Proxy {
  /// Start building a proxy.
  pub fn builder() -> ProxyBuilder {
    ProxyBuilder::default()
  }

  /// Accept connections until [`Proxy::shutdown`] is called.
  ///
  /// `read_timeout` bounds every read on a client connection; zero disables
  /// the bound. Each allowed connection runs on its own task; in-flight
  /// requests drain after shutdown.
  pub async fn serve(&self, listener: TcpListener, read_timeout: Duration) -> Result<()> {
    let engine = Arc::new(Engine {
      handler: self.handler.clone(),
      authority: self.authority.clone(),
      pool: self.pool.clone(),
      dial_timeout: self.dial_timeout,
      read_timeout: if read_timeout.is_zero() {
        None
      } else {
        Some(read_timeout)
      },
      upstream_tls: self.upstream_tls.clone(),
    });
    let mut shutdown = self.shutdown.subscribe();
    info!("proxy listening on {:?}", listener.local_addr().ok());
    loop {
      tokio::select! {
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              if !self.handler.should_allow_connection(peer) {
                debug!("{} connection denied", peer);
                continue;
              }
              let engine = engine.clone();
              tokio::spawn(engine.handle_connection(stream, peer));
            }
            Err(err) => error!("accept failed: {}", err),
          }
        }
        _ = shutdown.changed() => {
          info!("proxy stopping, listener closed");
          return Ok(());
        }
      }
    }
  }

  /// Stop accepting; `serve` returns and closes the listener. Workers keep
  /// running until their current request completes or a read deadline fires.
  pub fn shutdown(&self) {
    let _ = self.shutdown.send(true);
  }
}
