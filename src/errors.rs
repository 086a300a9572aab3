//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `trebuchet::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while intercepting and forwarding traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// The root identity could not be generated, loaded or persisted.
  #[error("certificate authority initialization failed: {0}")]
  AuthorityInit(String),
  /// A leaf certificate could not be issued.
  #[error("certificate issuance failed: {0}")]
  CertificateIssuance(String),
  /// TLS configuration or handshake error
  #[error("TLS error: {0}")]
  Tls(String),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// The client sent something that is not a usable HTTP/1.1 request.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The origin answered with something that is not a usable HTTP/1.1 response.
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  /// The origin could not be reached or dropped the exchange.
  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),
  /// Store collaborator failure
  #[error("store error: {0}")]
  Store(String),
  /// A stored record was not found.
  #[error("not found: {0}")]
  NotFound(String),
  /// Configuration error
  #[error("config error: {0}")]
  Config(String),
  /// The listening socket could not be bound.
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// requested address
    addr: String,
    /// cause
    source: std::io::Error,
  },
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create an authority bootstrap error and log it
  pub fn authority_init(msg: impl Into<String>) -> Self {
    let error = Error::AuthorityInit(msg.into());
    tracing::error!("[CA] {}", error);
    error
  }

  /// Create a leaf issuance error and log it
  pub fn certificate_issuance(msg: impl Into<String>) -> Self {
    let error = Error::CertificateIssuance(msg.into());
    tracing::error!("[CA] {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::debug!("[TLS] {}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamUnavailable(msg.into());
    tracing::warn!("[UPSTREAM] {}", error);
    error
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create an invalid response error
  pub fn invalid_response(msg: impl Into<String>) -> Self {
    Error::InvalidResponse(msg.into())
  }

  /// Create a store error
  pub fn store(msg: impl Into<String>) -> Self {
    Error::Store(msg.into())
  }

  /// Create a config error
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Tls(value.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    Error::Store(value.to_string())
  }
}

impl From<serde_yaml::Error> for Error {
  fn from(value: serde_yaml::Error) -> Self {
    Error::Config(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn named_errors_render_their_cause() {
    let e = Error::CertificateIssuance("no host identifiers".to_string());
    assert_eq!(e.to_string(), "certificate issuance failed: no host identifiers");
    let e = Error::UpstreamUnavailable("connection refused".to_string());
    assert_eq!(e.to_string(), "upstream unavailable: connection refused");
  }

  #[test]
  fn io_errors_convert() {
    let e: Error = std::io::Error::new(ErrorKind::BrokenPipe, "gone").into();
    assert!(matches!(e, Error::Io(ref io) if io.kind() == ErrorKind::BrokenPipe));
  }
}
