//! TLS configuration for both legs of an intercepted tunnel
//!
//! The client-facing leg presents leaves minted by the [`CertificateAuthority`],
//! the origin-facing leg is a plain rustls client. Neither side advertises
//! ALPN, so both always speak HTTP/1.1.
//!
//! [`CertificateAuthority`]: crate::ca::CertificateAuthority
use crate::ca::LeafIssuer;
use crate::errors::{Error, Result};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
  pki_types::{CertificateDer, ServerName, UnixTime},
  server::{ClientHello, ResolvesServerCert},
  sign::CertifiedKey,
  ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

/// The process-wide crypto provider, falling back to ring when none is installed.
pub fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Picks the leaf presented to an intercepted client.
///
/// The leaf issued for the CONNECT authority is served when the client sends
/// no SNI or an SNI naming that same host. Any other name gets its own leaf.
#[derive(Clone)]
pub struct LeafResolver {
  connect_host: String,
  default_key: Arc<CertifiedKey>,
  issuer: LeafIssuer,
}

impl std::fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafResolver")
      .field("connect_host", &self.connect_host)
      .finish_non_exhaustive()
  }
}

impl LeafResolver {
  /// Resolver for a tunnel to `connect_host` whose leaf was already issued
  pub fn new(connect_host: impl Into<String>, default_key: Arc<CertifiedKey>, issuer: LeafIssuer) -> Self {
    Self {
      connect_host: connect_host.into(),
      default_key,
      issuer,
    }
  }

  fn key_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
    match server_name {
      None => Some(self.default_key.clone()),
      Some(name) if name.eq_ignore_ascii_case(self.connect_host.trim_matches(['[', ']'])) => {
        Some(self.default_key.clone())
      }
      Some(name) => {
        tracing::debug!(
          "[TLS] SNI {} differs from CONNECT host {}, issuing a separate leaf",
          name,
          self.connect_host
        );
        match self.issuer.certified_key(name) {
          Ok(key) => Some(key),
          Err(e) => {
            tracing::warn!("[TLS] no leaf for SNI {}: {}", name, e);
            None
          }
        }
      }
    }
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    self.key_for(client_hello.server_name())
  }
}

/// Server configuration for the client-facing leg of a tunnel.
pub fn server_config(resolver: LeafResolver) -> Result<Arc<ServerConfig>> {
  let config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("server protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
  Ok(Arc::new(config))
}

/// Client configuration for the origin-facing leg.
///
/// With `verify` the origin must chain to a platform root or one of
/// `extra_roots`; without it any certificate chain is accepted, though
/// handshake signatures are still checked against the presented key.
pub fn client_config(verify: bool, extra_roots: &[CertificateDer<'static>]) -> Result<Arc<ClientConfig>> {
  let provider = crypto_provider();
  let builder = ClientConfig::builder_with_provider(provider.clone())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("client protocol versions: {}", e)))?;

  let config = if verify {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
      tracing::debug!("[TLS] skipping platform root: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!("[TLS] {} platform roots loaded, {} ignored", added, ignored);
    for cert in extra_roots {
      roots.add(cert.clone())?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(AcceptAnyChain::new(
        provider.signature_verification_algorithms,
      )))
      .with_no_client_auth()
  };
  Ok(Arc::new(config))
}

/// Read every certificate from a PEM bundle on disk.
pub fn load_certificates(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
  let path = path.as_ref();
  let file = std::fs::File::open(path)
    .map_err(|e| Error::tls(format!("cannot open {}: {}", path.display(), e)))?;
  let mut reader = BufReader::new(file);
  rustls_pemfile::certs(&mut reader)
    .map(|cert| cert.map_err(|_| Error::tls(format!("invalid certificate encoding in {}", path.display()))))
    .collect()
}

/// Convert a host into the name sent in SNI and checked against the origin certificate.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_matches(['[', ']']);
  ServerName::try_from(host.to_owned()).map_err(|e| Error::tls(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
struct AcceptAnyChain {
  algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyChain {
  fn new(algorithms: WebPkiSupportedAlgorithms) -> Self {
    Self { algorithms }
  }
}

impl ServerCertVerifier for AcceptAnyChain {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.algorithms.supported_schemes()
  }
}
