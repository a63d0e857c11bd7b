//! Request-target model with byte fidelity.
//!
//! `Uri` keeps the raw request-target exactly as received and splits it into
//! scheme, host, path, queries and fragments without normalizing anything.
//! Mutations rebuild the raw bytes and re-run the parse, so `full()` is always
//! the authoritative form that goes back on the wire.

use std::net::IpAddr;

/// A parsed request-target (or CONNECT authority).
#[derive(Debug, Default, Clone)]
pub struct Uri {
  is_connect: bool,

  full: Vec<u8>,
  scheme: Vec<u8>,
  host: Vec<u8>,

  path: Vec<u8>,
  queries: Vec<u8>,
  fragments: Vec<u8>,

  host_info: HostInfo,

  path_with_query_fragment: Vec<u8>,
  path_with_query_fragment_parsed: bool,
}

impl Uri {
  /// The raw request-target exactly as parsed.
  pub fn full(&self) -> &[u8] {
    &self.full
  }

  /// Scheme bytes without the trailing colon; empty when absent.
  pub fn scheme(&self) -> &[u8] {
    &self.scheme
  }

  /// Host bytes as they appeared in the request-target.
  pub fn host(&self) -> &[u8] {
    &self.host
  }

  /// Path bytes; `/` for non-CONNECT targets without an explicit path.
  pub fn path(&self) -> &[u8] {
    &self.path
  }

  /// Query bytes including the leading `?`.
  pub fn queries(&self) -> &[u8] {
    &self.queries
  }

  /// Fragment bytes including the leading `#`.
  pub fn fragments(&self) -> &[u8] {
    &self.fragments
  }

  /// True when this target came from a CONNECT request.
  pub fn is_connect(&self) -> bool {
    self.is_connect
  }

  /// Parsed host information.
  pub fn host_info(&self) -> &HostInfo {
    &self.host_info
  }

  /// Mutable host information, for pinning a resolved IP.
  pub fn host_info_mut(&mut self) -> &mut HostInfo {
    &mut self.host_info
  }

  /// Everything after the host: path, queries and fragments, computed lazily.
  ///
  /// This is the origin-form request-target used when forwarding directly to
  /// an origin or through a non-HTTP super proxy.
  pub fn path_with_query_fragment(&mut self) -> &[u8] {
    if self.path_with_query_fragment_parsed {
      return &self.path_with_query_fragment;
    }
    if self.is_connect {
      self.path_with_query_fragment.clear();
      self.path_with_query_fragment_parsed = true;
      return &self.path_with_query_fragment;
    }
    if self.host.is_empty() {
      self.path_with_query_fragment = self.full.clone();
    } else if let Some(host_index) = find_subsequence(&self.full, &self.host) {
      self.path_with_query_fragment = self.full[host_index + self.host.len()..].to_vec();
    }
    if self.path_with_query_fragment.is_empty() {
      self.path_with_query_fragment = self.path.clone();
    }
    self.path_with_query_fragment_parsed = true;
    &self.path_with_query_fragment
  }

  /// Reset every field so the value can be reused for the next request.
  pub fn reset(&mut self) {
    self.is_connect = false;
    self.full.clear();
    self.host.clear();
    self.host_info.reset();
    self.scheme.clear();
    self.path.clear();
    self.queries.clear();
    self.fragments.clear();
    self.path_with_query_fragment.clear();
    self.path_with_query_fragment_parsed = false;
  }

  /// Replace the host, rebuilding the raw target byte by byte and re-parsing.
  pub fn change_host(&mut self, host_with_port: &str) {
    if self.host_info.host_with_port == host_with_port {
      return;
    }
    let mut new_raw: Vec<u8> = Vec::new();
    if self.host.is_empty() {
      // no host in the target before, prepend it
      new_raw.extend_from_slice(host_with_port.as_bytes());
      if self.full.is_empty() || self.full[0] != b'/' {
        new_raw.push(b'/');
      }
      new_raw.extend_from_slice(&self.full);
    } else if let Some(host_index) = find_subsequence(&self.full, &self.host) {
      if host_with_port.is_empty() {
        new_raw.extend_from_slice(&self.full[host_index + self.host.len()..]);
      } else {
        // host already in the target, replace its first occurrence
        new_raw.extend_from_slice(&self.full[..host_index]);
        new_raw.extend_from_slice(host_with_port.as_bytes());
        new_raw.extend_from_slice(&self.full[host_index + self.host.len()..]);
      }
    }
    if new_raw.is_empty() {
      new_raw.push(b'/');
    }
    let is_connect = self.is_connect;
    self.parse(is_connect, &new_raw);
  }

  /// Replace path, queries and fragments, rebuilding the raw target and re-parsing.
  pub fn change_path_with_fragment(&mut self, new_path_with_fragment: &[u8]) {
    if self.is_connect {
      return;
    }
    if new_path_with_fragment == self.path_with_query_fragment() {
      return;
    }
    let mut new_raw: Vec<u8> = Vec::new();
    if self.host.is_empty() {
      new_raw.extend_from_slice(new_path_with_fragment);
    } else if let Some(host_index) = find_subsequence(&self.full, &self.host) {
      let host_end = host_index + self.host.len();
      new_raw.extend_from_slice(&self.full[..host_end]);
      if new_path_with_fragment.is_empty() || new_path_with_fragment[0] != b'/' {
        new_raw.push(b'/');
      }
      new_raw.extend_from_slice(new_path_with_fragment);
    }
    if new_raw.is_empty() {
      new_raw.push(b'/');
    }
    let is_connect = self.is_connect;
    self.parse(is_connect, &new_raw);
  }

  /// Parse a request-target. For CONNECT only the host survives.
  pub fn parse(&mut self, is_connect: bool, request_target: &[u8]) {
    self.reset();
    self.is_connect = is_connect;
    self.full = request_target.to_vec();
    if request_target.is_empty() {
      return;
    }
    if let Some(fragment_index) = request_target.iter().position(|b| *b == b'#') {
      self.fragments = request_target[fragment_index..].to_vec();
      self.parse_without_fragments(&request_target[..fragment_index]);
    } else {
      self.parse_without_fragments(request_target);
    }
    if !is_connect && self.path.is_empty() {
      self.path = b"/".to_vec();
    }
    if is_connect {
      self.scheme.clear();
      self.path.clear();
      self.queries.clear();
      self.fragments.clear();
    }
    let host = String::from_utf8_lossy(&self.host).into_owned();
    self.host_info.parse_host_with_port(&host, is_connect);
  }

  fn parse_without_fragments(&mut self, request_target: &[u8]) {
    if request_target.is_empty() {
      return;
    }
    if let Some(query_index) = request_target.iter().position(|b| *b == b'?') {
      self.queries = request_target[query_index..].to_vec();
      self.parse_without_queries_fragments(&request_target[..query_index]);
    } else {
      self.parse_without_queries_fragments(request_target);
    }
  }

  fn parse_without_queries_fragments(&mut self, request_target: &[u8]) {
    if request_target.is_empty() {
      return;
    }
    if let Some(scheme_end) = scheme_index(request_target) {
      self.scheme = request_target[..scheme_end].to_vec();
      self.parse_without_scheme_queries_fragments(&request_target[scheme_end + 1..]);
    } else {
      self.parse_without_scheme_queries_fragments(request_target);
    }
  }

  fn parse_without_scheme_queries_fragments(&mut self, request_target: &[u8]) {
    let mut request_target = request_target;
    // consume the leading slashes of an authority form
    if !self.scheme.is_empty()
      && request_target.len() >= 2
      && request_target[0] == b'/'
      && request_target[1] == b'/'
    {
      let mut slash_index = 0;
      for (i, b) in request_target.iter().enumerate() {
        if *b != b'/' {
          break;
        }
        slash_index = i;
      }
      request_target = &request_target[slash_index + 1..];
    }
    if request_target.is_empty() {
      return;
    }
    // only path
    if request_target[0] == b'/' {
      self.path = request_target.to_vec();
      return;
    }
    // host with path
    match request_target.iter().position(|b| *b == b'/') {
      Some(host_name_end) if host_name_end > 0 => {
        self.host = request_target[..host_name_end].to_vec();
        self.path = request_target[host_name_end..].to_vec();
      }
      _ => {
        self.host = request_target.to_vec();
      }
    }
  }
}

/// Index of the colon terminating the scheme, which must be `[A-Za-z0-9]+`.
fn scheme_index(raw: &[u8]) -> Option<usize> {
  for (i, c) in raw.iter().enumerate() {
    match c {
      b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => {}
      b':' => return Some(i),
      _ => return None,
    }
  }
  None
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  if needle.is_empty() {
    return Some(0);
  }
  if needle.len() > haystack.len() {
    return None;
  }
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}

/// Host, optional pinned IP and port derived from a request-target.
#[derive(Debug, Default, Clone)]
pub struct HostInfo {
  domain: String,
  ip: Option<IpAddr>,
  port: u16,
  host_with_port: String,
  // ip with port when an IP has been pinned, domain with port otherwise
  target_with_port: String,
}

impl HostInfo {
  fn reset(&mut self) {
    self.domain.clear();
    self.ip = None;
    self.port = 0;
    self.host_with_port.clear();
    self.target_with_port.clear();
  }

  /// Host without the port.
  pub fn domain(&self) -> &str {
    &self.domain
  }

  /// IP when the host is an IP literal or one has been pinned with `set_ip`.
  pub fn ip(&self) -> Option<IpAddr> {
    self.ip
  }

  /// Port, defaulted from the scheme when the authority has none.
  pub fn port(&self) -> u16 {
    self.port
  }

  /// `host:port` as dialed for SNI and Host headers.
  pub fn host_with_port(&self) -> &str {
    &self.host_with_port
  }

  /// `ip:port` when an IP is pinned, `host:port` otherwise.
  pub fn target_with_port(&self) -> &str {
    &self.target_with_port
  }

  /// Parse `host[:port]`, defaulting the port to 443 for HTTPS/CONNECT and 80
  /// otherwise. IPv6 literals are recognized by the last `]` before the colon.
  pub fn parse_host_with_port(&mut self, host: &str, is_https: bool) {
    if host.is_empty() {
      return;
    }
    let last_colon = host.rfind(':').map(|i| i as isize).unwrap_or(-1);
    let last_bracket = host.rfind(']').map(|i| i as isize).unwrap_or(-1);

    if last_colon <= last_bracket {
      self.domain = host.to_string();
      self.port = if is_https { 443 } else { 80 };
    } else {
      let colon = last_colon as usize;
      let (raw_host, raw_port) = (&host[..colon], &host[colon + 1..]);
      let port = match raw_port.parse::<u16>() {
        Ok(p) => p,
        Err(_) => {
          self.reset();
          return;
        }
      };
      let domain = if let Some(inner) = raw_host.strip_prefix('[') {
        match inner.strip_suffix(']') {
          Some(inner) => inner,
          None => {
            self.reset();
            return;
          }
        }
      } else if raw_host.contains(':') {
        // bare IPv6 without brackets is ambiguous
        self.reset();
        return;
      } else {
        raw_host
      };
      self.domain = domain.to_string();
      self.port = port;
    }
    if self.domain.is_empty() {
      return;
    }

    self.ip = self.domain.parse::<IpAddr>().ok();

    self.host_with_port = join_host_port(&self.domain, self.port);
    self.target_with_port = self.host_with_port.clone();
  }

  /// Pin a resolved IP; `target_with_port` becomes `ip:port`.
  pub fn set_ip(&mut self, ip: IpAddr) {
    self.ip = Some(ip);
    self.target_with_port = join_host_port(&ip.to_string(), self.port);
  }
}

fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}
