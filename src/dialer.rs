//! DNS-cached, concurrency-limited upstream dialing.
//!
//! Resolved addresses are cached for [`DNS_CACHE_DURATION`] and handed out
//! with a round-robin starting index, so temporarily unreachable addresses are
//! routed around. A bounded semaphore caps concurrent connects to protect the
//! ephemeral port range when a downstream misbehaves.

use crate::errors::{Error, Result};
use crate::uri::HostInfo;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Timeout used when `dial` is passed a zero duration.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a resolved address set stays fresh.
pub const DNS_CACHE_DURATION: Duration = Duration::from_secs(60);

const MAX_DIAL_CONCURRENCY: usize = 1000;

struct TcpAddrEntry {
  addrs: Vec<SocketAddr>,
  addrs_idx: AtomicU32,
  resolve_time: Instant,
  pending: AtomicBool,
}

/// The shared dialer behind every upstream connection.
pub struct Dialer {
  entries: Mutex<HashMap<String, Arc<TcpAddrEntry>>>,
  resolver: TokioResolver,
  concurrency: Arc<Semaphore>,
  reaper_started: AtomicBool,
}

static DIALER: OnceLock<Dialer> = OnceLock::new();

/// The process-wide dialer. The cleanup task starts on first use.
pub fn dialer() -> &'static Dialer {
  let d = DIALER.get_or_init(Dialer::new);
  d.ensure_reaper();
  d
}

impl Dialer {
  fn new() -> Self {
    let resolver = match TokioResolver::builder_tokio() {
      Ok(builder) => builder.build(),
      Err(_) => {
        TokioResolver::builder_with_config(
          ResolverConfig::default(),
          TokioConnectionProvider::default(),
        )
        .build()
      }
    };
    Self {
      entries: Mutex::new(HashMap::new()),
      resolver,
      concurrency: Arc::new(Semaphore::new(MAX_DIAL_CONCURRENCY)),
      reaper_started: AtomicBool::new(false),
    }
  }

  fn ensure_reaper(&'static self) {
    if self
      .reaper_started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      tokio::spawn(async move {
        let expire = 2 * DNS_CACHE_DURATION;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
          tick.tick().await;
          let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
          entries.retain(|_, e| e.resolve_time.elapsed() <= expire);
        }
      });
    }
  }

  /// Dial `host:port`, resolving through the cache and rotating through the
  /// resolved addresses until the deadline.
  pub async fn dial(&self, host_with_port: &str, timeout: Duration) -> Result<TcpStream> {
    let timeout = if timeout.is_zero() {
      DEFAULT_DIAL_TIMEOUT
    } else {
      timeout
    };
    let deadline = Instant::now() + timeout;

    let (entry, idx) = self.get_tcp_addrs(host_with_port).await?;
    let n = entry.addrs.len() as u32;
    let mut last_err = Error::Dns(format!("no addresses for {}", host_with_port));
    for i in 0..n {
      let addr = entry.addrs[(idx.wrapping_add(i) % n) as usize];
      match self.try_dial(addr, deadline).await {
        Ok(conn) => return Ok(conn),
        // a timeout has consumed the whole deadline, rotating is pointless
        Err(Error::DialTimeout) => return Err(Error::DialTimeout),
        Err(err) => last_err = err,
      }
    }
    Err(last_err)
  }

  async fn try_dial(&self, addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    let remaining = deadline
      .checked_duration_since(Instant::now())
      .ok_or(Error::DialTimeout)?;
    let permit = tokio::time::timeout(remaining, self.concurrency.clone().acquire_owned())
      .await
      .map_err(|_| Error::DialTimeout)?
      .map_err(|_| Error::Other("dial semaphore closed".to_string()))?;

    let remaining = deadline
      .checked_duration_since(Instant::now())
      .ok_or(Error::DialTimeout)?;
    let conn = tokio::time::timeout(remaining, TcpStream::connect(addr))
      .await
      .map_err(|_| Error::DialTimeout)??;
    drop(permit);
    Ok(conn)
  }

  /// Cached resolution plus the next round-robin index; callers take `idx % n`.
  async fn get_tcp_addrs(&self, addr: &str) -> Result<(Arc<TcpAddrEntry>, u32)> {
    let cached = {
      let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
      match entries.get(addr) {
        Some(e)
          if !e.pending.load(Ordering::Acquire)
            && e.resolve_time.elapsed() > DNS_CACHE_DURATION =>
        {
          // stale: this caller refreshes, everyone else keeps the old entry
          e.pending.store(true, Ordering::Release);
          None
        }
        Some(e) => Some(e.clone()),
        None => None,
      }
    };

    let entry = match cached {
      Some(e) => e,
      None => match self.resolve(addr).await {
        Ok(addrs) => {
          let entry = Arc::new(TcpAddrEntry {
            addrs,
            addrs_idx: AtomicU32::new(0),
            resolve_time: Instant::now(),
            pending: AtomicBool::new(false),
          });
          let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
          entries.insert(addr.to_string(), entry.clone());
          entry
        }
        Err(err) => {
          // transient failure keeps the old entry, just clear the refresh mark
          let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
          if let Some(e) = entries.get(addr) {
            e.pending.store(false, Ordering::Release);
          }
          return Err(err);
        }
      },
    };

    let idx = entry.addrs_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    Ok((entry, idx))
  }

  async fn resolve(&self, addr: &str) -> Result<Vec<SocketAddr>> {
    let mut info = HostInfo::default();
    info.parse_host_with_port(addr, false);
    if info.host_with_port().is_empty() {
      return Err(Error::Dns(format!("invalid address {}", addr)));
    }
    if let Some(ip) = info.ip() {
      return Ok(vec![SocketAddr::new(ip, info.port())]);
    }
    let lookup = self
      .resolver
      .lookup_ip(info.domain())
      .await
      .map_err(|e| Error::Dns(e.to_string()))?;
    let addrs: Vec<SocketAddr> = lookup
      .iter()
      .map(|ip| SocketAddr::new(ip, info.port()))
      .collect();
    if addrs.is_empty() {
      return Err(Error::Dns(format!("no DNS entries for {}", addr)));
    }
    Ok(addrs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fake_entry(addrs: Vec<SocketAddr>, age: Duration) -> Arc<TcpAddrEntry> {
    Arc::new(TcpAddrEntry {
      addrs,
      addrs_idx: AtomicU32::new(0),
      resolve_time: Instant::now() - age,
      pending: AtomicBool::new(false),
    })
  }

  #[tokio::test]
  async fn round_robin_rotates_starting_index() {
    let dialer = Dialer::new();
    let addrs = vec![
      "127.0.0.1:10001".parse().unwrap(),
      "127.0.0.1:10002".parse().unwrap(),
    ];
    dialer
      .entries
      .lock()
      .unwrap()
      .insert("rr.test:80".to_string(), fake_entry(addrs, Duration::ZERO));

    let mut starts = [0usize; 2];
    for _ in 0..10 {
      let (entry, idx) = dialer.get_tcp_addrs("rr.test:80").await.unwrap();
      let n = entry.addrs.len() as u32;
      starts[(idx % n) as usize] += 1;
    }
    assert_eq!(starts[0], 5);
    assert_eq!(starts[1], 5);
  }

  #[tokio::test]
  async fn ip_literal_skips_the_resolver() {
    let dialer = Dialer::new();
    let addrs = dialer.resolve("127.0.0.1:8080").await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
  }

  #[tokio::test]
  async fn stale_entry_admits_one_refresher() {
    let dialer = Dialer::new();
    let addrs: Vec<SocketAddr> = vec!["127.0.0.1:10001".parse().unwrap()];
    // the key has an unparseable port so the refresh fails without touching
    // the network; the stale entry must survive with its pending mark cleared
    dialer.entries.lock().unwrap().insert(
      "stale:x".to_string(),
      fake_entry(addrs, DNS_CACHE_DURATION + Duration::from_secs(1)),
    );

    let err = dialer.get_tcp_addrs("stale:x").await;
    assert!(err.is_err());
    let entries = dialer.entries.lock().unwrap();
    let entry = entries.get("stale:x").unwrap();
    assert!(!entry.pending.load(Ordering::Acquire));
  }

  #[tokio::test]
  async fn dial_connects_to_loopback_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dialer = Dialer::new();
    let conn = dialer
      .dial(&addr.to_string(), Duration::from_secs(2))
      .await
      .unwrap();
    assert!(conn.peer_addr().is_ok());
  }

  #[tokio::test]
  async fn expired_deadline_is_a_dial_timeout() {
    let dialer = Dialer::new();
    let deadline = Instant::now() - Duration::from_millis(1);
    let err = dialer
      .try_dial("127.0.0.1:10001".parse().unwrap(), deadline)
      .await;
    assert!(matches!(err, Err(Error::DialTimeout)));
  }
}
