//! TLS interception engine.
//!
//! [`MitmAuthority`] wraps the embedder-supplied CA and issues leaf
//! certificates on demand, one per intercepted host. Leaves share a single
//! in-memory key pair; only the certificate differs per host. Issued leaves
//! are cached until they near expiry. Duplicate concurrent issuance for the
//! same host is tolerated; the cache keeps one winner and the loser's
//! certificate is discarded.

use crate::errors::{Error, Result};
use moka::sync::Cache;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, ServerConfig,
  SignatureScheme,
};

/// Leaf validity period in seconds (1 year).
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live: half the leaf validity.
const CACHE_TTL_SECS: u64 = (TTL_SECS / 2) as u64;
/// Leaves are backdated one hour to absorb clock skew.
const NOT_BEFORE_SKEW_SECS: i64 = 60 * 60;

/// A leaf certificate chain and its private key.
pub struct IssuedCert {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl IssuedCert {
  /// The chain: leaf first, then the CA certificate.
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// A clone of the leaf private key.
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
}

/// Per-host leaf issuance backed by the embedder's CA.
pub struct MitmAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  leaf_key: KeyPair,
  leaf_key_der: PrivateKeyDer<'static>,
  cache: Cache<String, Arc<IssuedCert>>,
}

impl MitmAuthority {
  /// Build the authority from CA certificate and key PEM strings.
  pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(ca_key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to load CA cert: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode CA PEM: {}", e)))?;

    let leaf_key = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;
    let leaf_key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      leaf_key,
      leaf_key_der,
      cache: Cache::builder()
        .max_capacity(1024)
        .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
        .build(),
    })
  }

  /// Build the authority from CA certificate and key PEM files.
  pub fn from_pem_files(
    ca_cert_path: impl AsRef<Path>,
    ca_key_path: impl AsRef<Path>,
  ) -> Result<Self> {
    let cert_pem = std::fs::read_to_string(ca_cert_path)?;
    let key_pem = std::fs::read_to_string(ca_key_path)?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Generate a fresh self-signed CA, returned as (cert PEM, key PEM).
  ///
  /// Meant for tests and first-run setups; the cert must be installed in the
  /// client's trust store for interception to work.
  pub fn generate_ca(common_name: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
      rcgen::KeyUsagePurpose::KeyCertSign,
      rcgen::KeyUsagePurpose::CrlSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TimeDuration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// The CA certificate in DER form, for building client trust stores.
  pub fn ca_cert_der(&self) -> CertificateDer<'static> {
    self.ca_cert_der.clone()
  }

  /// Look up or issue the leaf for `host` (the bare domain or IP, no port).
  pub fn get_or_issue(&self, host: &str) -> Result<Arc<IssuedCert>> {
    if let Some(cached) = self.cache.get(host) {
      return Ok(cached);
    }
    let issued = Arc::new(self.issue(host)?);
    self.cache.insert(host.to_string(), issued.clone());
    Ok(issued)
  }

  /// TLS server configuration presenting the leaf for `host`.
  pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let issued = self.get_or_issue(host)?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(issued.chain.clone(), issued.key())
      .map_err(|e| Error::certificate(format!("failed to build server config: {}", e)))?;
    Ok(Arc::new(config))
  }

  fn issue(&self, host: &str) -> Result<IssuedCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = vec![match host.parse::<IpAddr>() {
      Ok(ip) => SanType::IpAddress(ip),
      Err(_) => SanType::DnsName(
        host
          .try_into()
          .map_err(|_| Error::certificate(format!("invalid host name: {}", host)))?,
      ),
    }];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + TimeDuration::seconds(TTL_SECS);

    let cert = params
      .signed_by(&self.leaf_key, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    Ok(IssuedCert {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key: self.leaf_key_der.clone_key(),
    })
  }
}

/// Client TLS configuration for proxy-originated upstream connections.
///
/// `extra_roots` extends the (otherwise empty) trust store; `insecure` skips
/// certificate verification entirely.
pub fn upstream_client_config(
  extra_roots: &[CertificateDer<'static>],
  insecure: bool,
) -> Result<ClientConfig> {
  if insecure {
    return Ok(
      ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth(),
    );
  }
  let mut roots = RootCertStore::empty();
  for cert in extra_roots {
    roots
      .add(cert.clone())
      .map_err(|e| Error::certificate(format!("bad root certificate: {}", e)))?;
  }
  Ok(
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// A verifier that accepts any server certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TlsError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}
