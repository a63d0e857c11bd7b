//! Operator policy hooks.

use crate::hijack::{HijackerPool, NOOP_HIJACKER_POOL};
use crate::superproxy::SuperProxy;
use std::net::SocketAddr;
use std::sync::Arc;

/// Policy consulted by the request engine. Every method has a permissive
/// default, so an embedder only overrides what it cares about.
pub trait Handler: Send + Sync {
  /// Gate a freshly accepted connection; `false` drops it before any read.
  fn should_allow_connection(&self, _remote: SocketAddr) -> bool {
    true
  }

  /// Choose between splicing a CONNECT tunnel opaquely (`false`) and
  /// terminating TLS locally (`true`). Receives the full `host:port`, so
  /// non-443 ports are the embedder's call.
  fn should_decrypt_host(&self, _host_with_port: &str) -> bool {
    false
  }

  /// Pick the super proxy for a destination; `None` dials the origin
  /// directly. `uri` is the raw request-target, empty for CONNECT tunnels.
  fn url_proxy(&self, _host_with_port: &str, _uri: &[u8]) -> Option<Arc<SuperProxy>> {
    None
  }

  /// The pool hijackers are drawn from, one per request.
  fn hijacker_pool(&self) -> &dyn HijackerPool {
    &NOOP_HIJACKER_POOL
  }
}

/// A handler that allows everything, splices every tunnel and dials directly.
pub struct DirectHandler;

impl Handler for DirectHandler {}
