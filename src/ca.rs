//! Certificate Authority (CA) for the intercepting proxy
//!
//! The authority owns the root signing identity and issues short-lived leaf
//! certificates for the hosts clients tunnel to. The root is created once per
//! storage directory and reused on every later start; leaves are never
//! written to disk.
//!

use crate::errors::{Error, Result};
use moka::sync::Cache;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// File name of the PEM encoded root certificate inside the storage directory
pub const CA_CERT_FILE: &str = "ca.crt";
/// File name of the PEM encoded root private key inside the storage directory
pub const CA_KEY_FILE: &str = "ca.key";
/// Validity window of every issued leaf
pub const LEAF_VALIDITY: Duration = Duration::hours(24);
/// Root validity (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
const ROOT_PATH_LEN: u8 = 2;
const ROOT_ORGANIZATION: &str = "Trebuchet MITM Proxy";
/// 256-bit serial numbers
const SERIAL_BYTES: usize = 32;
/// Cached leaves are dropped well before they expire
const LEAF_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(12 * 60 * 60);

fn bootstrap_lock() -> &'static Mutex<()> {
  static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
  LOCK.get_or_init(|| Mutex::new(()))
}

/// Certificate Authority holding the root identity
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
  /// Expiry of the root, no leaf may outlive it
  not_after: OffsetDateTime,
  /// Directory the root was loaded from or persisted to
  storage_path: Option<PathBuf>,
}

impl Debug for CertificateAuthority {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("not_after", &self.not_after)
      .field("storage_path", &self.storage_path)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the root identity stored in `storage_path`, or create and persist
  /// a new one if none exists yet.
  ///
  /// Concurrent callers in the same process are serialised, so a directory
  /// only ever receives one root.
  pub async fn bootstrap(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    let _guard = bootstrap_lock().lock().await;

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await.map_err(|e| {
        Error::authority_init(format!("cannot create {}: {}", storage_path.display(), e))
      })?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let mut ca = if cert_path.exists() && key_path.exists() {
      tracing::info!("[CA] loading root identity from {}", cert_path.display());
      let cert_pem = fs::read_to_string(&cert_path)
        .await
        .map_err(|e| Error::authority_init(format!("cannot read {}: {}", cert_path.display(), e)))?;
      let key_pem = fs::read_to_string(&key_path)
        .await
        .map_err(|e| Error::authority_init(format!("cannot read {}: {}", key_path.display(), e)))?;
      Self::from_pem(&cert_pem, &key_pem)?
    } else {
      tracing::info!("[CA] generating root identity in {}", storage_path.display());
      let (cert_pem, key_pem) = Self::generate_root()?;
      // key first: a certificate on disk implies a complete pair
      persist(&key_path, &key_pem).await?;
      persist(&cert_path, &cert_pem).await?;
      Self::from_pem(&cert_pem, &key_pem)?
    };
    ca.storage_path = Some(storage_path);
    Ok(ca)
  }

  /// Create an in-memory authority that is never persisted.
  pub fn generate() -> Result<Self> {
    let (cert_pem, key_pem) = Self::generate_root()?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build an authority from an existing PEM certificate and PEM private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::authority_init(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::authority_init(format!("failed to create issuer from CA cert: {}", e)))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::authority_init("no certificate found in PEM"))?
      .map_err(|e| Error::authority_init(format!("failed to parse PEM: {}", e)))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&ca_cert_der)
      .map_err(|e| Error::authority_init(format!("failed to parse CA cert: {}", e)))?;
    let not_after = parsed.validity().not_after.to_datetime();

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      not_after,
      storage_path: None,
    })
  }

  fn generate_root() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, root_common_name());
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(ROOT_PATH_LEN));
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyAgreement,
      KeyUsagePurpose::ContentCommitment,
      KeyUsagePurpose::DataEncipherment,
    ];

    let now = now_utc_seconds()?;
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
      .map_err(|e| Error::authority_init(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::authority_init(format!("failed to sign root certificate: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Issue a leaf certificate for `hosts`, signed by the root.
  ///
  /// The first host becomes the subject common name; every host is added as
  /// a subject alternative name, as an IP entry when it parses as an address
  /// and as a DNS entry otherwise.
  pub fn issue_leaf<H: AsRef<str>>(&self, hosts: &[H]) -> Result<LeafCertificate> {
    let hosts: Vec<String> = hosts.iter().map(|h| normalize_host(h.as_ref())).collect();
    let common_name = hosts
      .first()
      .ok_or_else(|| Error::certificate_issuance("no host identifiers"))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.as_str());
    params.distinguished_name = dn;

    params.subject_alt_names = hosts
      .iter()
      .map(|host| subject_alt_name(host))
      .collect::<Result<Vec<_>>>()?;

    let not_before = now_utc_seconds().map_err(|e| Error::certificate_issuance(e.to_string()))?;
    let not_after = not_before + LEAF_VALIDITY;
    if not_after >= self.not_after {
      return Err(Error::certificate_issuance(format!(
        "root identity expires at {}, before a leaf for {} would",
        self.not_after, common_name
      )));
    }
    params.not_before = not_before;
    params.not_after = not_after;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyAgreement,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_issuance(format!("failed to sign leaf: {}", e)))?;
    tracing::debug!("[CA] issued leaf for {:?}", hosts);

    Ok(LeafCertificate {
      hosts,
      cert_der: CertificateDer::from(cert.der().to_vec()),
      key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
      not_before,
      not_after,
    })
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate in PEM format, for installation in client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Path of the persisted root certificate, if this authority is backed by disk
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.storage_path.as_ref().map(|p| p.join(CA_CERT_FILE))
  }

  /// Expiry of the root certificate
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

/// A leaf certificate bound to its freshly generated private key
#[derive(Debug)]
pub struct LeafCertificate {
  hosts: Vec<String>,
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
}

impl LeafCertificate {
  /// Host identifiers the leaf was issued for, common name first
  pub fn hosts(&self) -> &[String] {
    &self.hosts
  }

  /// Leaf certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Leaf private key (PKCS#8)
  pub fn key_der(&self) -> &PrivateKeyDer<'static> {
    &self.key_der
  }

  /// Chain presented to clients: the leaf only, the root is trusted out of band.
  pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
    vec![self.cert_der.clone()]
  }

  /// Start of the validity window
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  /// End of the validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// Convert into a rustls `CertifiedKey` ready to be served.
  pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
    let signing_key = tokio_rustls::rustls::crypto::ring::sign::any_supported_type(&self.key_der)
      .map_err(|e| Error::certificate_issuance(format!("unusable leaf key: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(self.cert_chain(), signing_key)))
  }
}

/// Per-host memory of served leaves
#[derive(Clone)]
pub struct LeafCache {
  inner: Cache<String, Arc<CertifiedKey>>,
}

impl LeafCache {
  /// Create a cache holding at most `capacity` hosts
  pub fn new(capacity: u64) -> Self {
    Self {
      inner: Cache::builder()
        .max_capacity(capacity)
        .time_to_live(LEAF_CACHE_TTL)
        .build(),
    }
  }

  /// Cached leaf for `host`
  pub fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
    self.inner.get(&host.to_ascii_lowercase())
  }

  /// Remember the leaf served for `host`
  pub fn insert(&self, host: &str, key: Arc<CertifiedKey>) {
    self.inner.insert(host.to_ascii_lowercase(), key);
  }
}

/// Hands out rustls-ready leaves, going through a [`LeafCache`] when one is configured.
#[derive(Clone)]
pub struct LeafIssuer {
  authority: Arc<CertificateAuthority>,
  cache: Option<LeafCache>,
}

impl LeafIssuer {
  /// Issue a fresh leaf for every request
  pub fn new(authority: Arc<CertificateAuthority>) -> Self {
    Self {
      authority,
      cache: None,
    }
  }

  /// Reuse leaves per host
  pub fn with_cache(authority: Arc<CertificateAuthority>, cache: LeafCache) -> Self {
    Self {
      authority,
      cache: Some(cache),
    }
  }

  /// The signing authority
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.authority
  }

  /// Leaf to present for `host`
  pub fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(host)) {
      return Ok(cached);
    }
    let key = self.authority.issue_leaf(&[host])?.certified_key()?;
    if let Some(cache) = &self.cache {
      cache.insert(host, key.clone());
    }
    Ok(key)
  }
}

async fn persist(path: &Path, contents: &str) -> Result<()> {
  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();
  let tmp = path.with_file_name(format!(".{}.tmp", file_name));
  fs::write(&tmp, contents.as_bytes())
    .await
    .map_err(|e| Error::authority_init(format!("cannot write {}: {}", tmp.display(), e)))?;
  fs::rename(&tmp, path)
    .await
    .map_err(|e| Error::authority_init(format!("cannot write {}: {}", path.display(), e)))
}

fn random_serial() -> SerialNumber {
  let mut bytes = vec![0u8; SERIAL_BYTES];
  rand::thread_rng().fill_bytes(&mut bytes);
  // keep the DER integer minimal
  if bytes[0] == 0 {
    bytes[0] = 1;
  }
  SerialNumber::from(bytes)
}

fn now_utc_seconds() -> Result<OffsetDateTime> {
  OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
    .map_err(|e| Error::Other(format!("clock out of range: {}", e)))
}

fn root_common_name() -> String {
  ["HOSTNAME", "COMPUTERNAME"]
    .iter()
    .filter_map(|k| std::env::var(k).ok())
    .find(|v| !v.trim().is_empty())
    .unwrap_or_else(|| "trebuchet".to_string())
}

fn normalize_host(host: &str) -> String {
  let host = host.trim();
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
    .to_string()
}

fn subject_alt_name(host: &str) -> Result<SanType> {
  if let Ok(ip) = host.parse::<IpAddr>() {
    return Ok(SanType::IpAddress(ip));
  }
  Ok(SanType::DnsName(host.try_into().map_err(|_| {
    Error::certificate_issuance(format!("invalid DNS name: {}", host))
  })?))
}

#[cfg(test)]
mod tests {
  use super::*;
  use x509_parser::extensions::GeneralName;
  use x509_parser::prelude::*;

  fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trebuchet-ca-{}-{}", name, std::process::id()));
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    dir
  }

  #[test]
  fn root_is_a_constrained_ca() {
    let ca = CertificateAuthority::generate().unwrap();
    let (_, root) = parse_x509_certificate(ca.ca_cert_der()).unwrap();
    let bc = root.basic_constraints().unwrap().unwrap();
    assert!(bc.value.ca);
    assert_eq!(bc.value.path_len_constraint, Some(2));
    let key_usage = root.key_usage().unwrap().unwrap();
    assert!(key_usage.value.key_cert_sign());
    assert!(key_usage.value.crl_sign());
    assert!(key_usage.value.digital_signature());
    assert!(key_usage.value.key_agreement());
    let lifetime = root.validity().not_after.timestamp() - root.validity().not_before.timestamp();
    assert_eq!(lifetime, ROOT_VALIDITY_DAYS * 24 * 60 * 60);
  }

  #[test]
  fn leaf_chains_to_root_with_dns_san() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.issue_leaf(&["example.test"]).unwrap();
    let (_, root) = parse_x509_certificate(ca.ca_cert_der()).unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();

    assert!(cert.verify_signature(Some(root.public_key())).is_ok());
    assert_eq!(cert.issuer(), root.subject());
    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "example.test");

    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san
      .value
      .general_names
      .iter()
      .any(|n| matches!(n, GeneralName::DNSName("example.test"))));
  }

  #[test]
  fn ip_hosts_become_ip_sans() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.issue_leaf(&["127.0.0.1", "[::1]", "localhost"]).unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    let names = &san.value.general_names;
    assert!(names
      .iter()
      .any(|n| matches!(n, GeneralName::IPAddress(b) if *b == [127, 0, 0, 1])));
    assert!(names
      .iter()
      .any(|n| matches!(n, GeneralName::IPAddress(b) if b.len() == 16 && b[15] == 1)));
    assert!(names
      .iter()
      .any(|n| matches!(n, GeneralName::DNSName("localhost"))));
    assert!(!names
      .iter()
      .any(|n| matches!(n, GeneralName::DNSName("127.0.0.1"))));
  }

  #[test]
  fn leaf_lives_exactly_one_day_inside_root() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.issue_leaf(&["example.test"]).unwrap();
    assert_eq!(leaf.not_after() - leaf.not_before(), LEAF_VALIDITY);
    assert!(leaf.not_after() < ca.not_after());

    let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
    let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
    assert_eq!(lifetime, 24 * 60 * 60);
  }

  #[test]
  fn serials_are_random_per_issuance() {
    let ca = CertificateAuthority::generate().unwrap();
    let a = ca.issue_leaf(&["example.test"]).unwrap();
    let b = ca.issue_leaf(&["example.test"]).unwrap();
    let (_, a) = parse_x509_certificate(a.cert_der()).unwrap();
    let (_, b) = parse_x509_certificate(b.cert_der()).unwrap();
    assert_ne!(a.raw_serial(), b.raw_serial());
    assert!(a.raw_serial().len() >= 31);
  }

  #[test]
  fn empty_host_list_is_rejected() {
    let ca = CertificateAuthority::generate().unwrap();
    let hosts: [&str; 0] = [];
    assert!(matches!(
      ca.issue_leaf(&hosts),
      Err(Error::CertificateIssuance(_))
    ));
  }

  #[test]
  fn leaf_converts_to_certified_key() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.issue_leaf(&["example.test"]).unwrap();
    let key = leaf.certified_key().unwrap();
    assert_eq!(key.cert.len(), 1);
    assert_eq!(&key.cert[0], leaf.cert_der());
  }

  #[test]
  fn issuer_reuses_cached_leaves() {
    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    let cached = LeafIssuer::with_cache(ca.clone(), LeafCache::new(16));
    let a = cached.certified_key("Example.Test").unwrap();
    let b = cached.certified_key("example.test").unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let uncached = LeafIssuer::new(ca);
    let c = uncached.certified_key("example.test").unwrap();
    let d = uncached.certified_key("example.test").unwrap();
    assert!(!Arc::ptr_eq(&c, &d));
  }

  #[tokio::test]
  async fn bootstrap_reuses_persisted_root() {
    let dir = temp_dir("reuse");
    let first = CertificateAuthority::bootstrap(&dir).await.unwrap();
    assert!(dir.join(CA_CERT_FILE).exists());
    assert!(dir.join(CA_KEY_FILE).exists());
    let second = CertificateAuthority::bootstrap(&dir).await.unwrap();
    assert_eq!(first.ca_cert_der(), second.ca_cert_der());
    assert_eq!(first.not_after(), second.not_after());

    // leaves from the reloaded root still chain to the original one
    let leaf = second.issue_leaf(&["example.test"]).unwrap();
    let (_, root) = parse_x509_certificate(first.ca_cert_der()).unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
    assert!(cert.verify_signature(Some(root.public_key())).is_ok());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn concurrent_bootstrap_creates_one_root() {
    let dir = temp_dir("race");
    let (a, b) = tokio::join!(
      CertificateAuthority::bootstrap(&dir),
      CertificateAuthority::bootstrap(&dir)
    );
    assert_eq!(a.unwrap().ca_cert_der(), b.unwrap().ca_cert_der());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn root_expiry_is_read_from_the_certificate() {
    let ca = CertificateAuthority::generate().unwrap();
    let expected = OffsetDateTime::now_utc() + Duration::days(ROOT_VALIDITY_DAYS);
    assert!((ca.not_after() - expected).abs() < Duration::minutes(5));
  }

  #[test]
  fn from_pem_rejects_garbage() {
    assert!(matches!(
      CertificateAuthority::from_pem("not a cert", "not a key"),
      Err(Error::AuthorityInit(_))
    ));
  }
}
