//! YAML configuration
//!
//! Every field has a default, so an empty or missing file yields a working
//! proxy listening on `127.0.0.1:8080` with an in-memory store.
use crate::ca::LeafCache;
use crate::client::{ClientBuilder, ForwardingClient};
use crate::errors::{Error, Result};
use crate::injector::{DEFAULT_PATH_PAYLOAD, DEFAULT_VALUE_PAYLOAD};
use crate::store::{FileStore, MemoryStore, RandomIdGenerator, Store};
use crate::tls;
use crate::tunnel::TunnelOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
  /// `host:port`; a bare `:port` listens on every interface
  #[serde(alias = "port")]
  pub listen: String,
  /// tracing level or filter directive
  pub log_level: String,
  /// How long shutdown waits for live tunnels before closing them
  pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8080".to_string(),
      log_level: "info".to_string(),
      shutdown_grace_secs: 5,
    }
  }
}

/// Root identity settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaConfig {
  /// Directory holding `ca.crt` and `ca.key`
  pub dir: PathBuf,
  /// Reuse one leaf per host instead of issuing one per handshake
  pub cache_leaves: bool,
  pub cache_capacity: u64,
}

impl Default for CaConfig {
  fn default() -> Self {
    Self {
      dir: PathBuf::from("certs"),
      cache_leaves: false,
      cache_capacity: 1000,
    }
  }
}

/// Outbound connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
  /// Verify origin certificates
  pub verify_certs: bool,
  /// PEM files trusted in addition to the platform store
  pub extra_roots: Vec<PathBuf>,
  pub connect_timeout_secs: Option<u64>,
  /// Per read/write deadline on origin sockets
  pub timeout_secs: Option<u64>,
  /// Largest response body read from an origin
  pub max_body_bytes: Option<usize>,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      verify_certs: true,
      extra_roots: Vec::new(),
      connect_timeout_secs: Some(10),
      timeout_secs: Some(60),
      max_body_bytes: Some(64 * 1024 * 1024),
    }
  }
}

/// HTTPS interception settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
  pub capture: bool,
  pub max_capture_bytes: Option<usize>,
  pub idle_timeout_secs: Option<u64>,
  /// Milliseconds the other direction may keep flowing after one side closes
  pub close_grace_millis: u64,
}

impl Default for TunnelConfig {
  fn default() -> Self {
    let options = TunnelOptions::default();
    Self {
      capture: options.capture,
      max_capture_bytes: options.max_capture_bytes,
      idle_timeout_secs: None,
      close_grace_millis: options.close_grace.as_millis() as u64,
    }
  }
}

/// Which store backs captured exchanges
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
  #[default]
  Memory,
  File,
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
  pub kind: StoreKind,
  /// Directory for the file store
  pub dir: PathBuf,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      kind: StoreKind::Memory,
      dir: PathBuf::from("records"),
    }
  }
}

/// Replay settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InjectorConfig {
  pub enabled: bool,
  pub path_payload: String,
  pub value_payload: String,
}

impl Default for InjectorConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path_payload: DEFAULT_PATH_PAYLOAD.to_string(),
      value_payload: DEFAULT_VALUE_PAYLOAD.to_string(),
    }
  }
}

/// Process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub ca: CaConfig,
  pub upstream: UpstreamConfig,
  pub tunnel: TunnelConfig,
  pub store: StoreConfig,
  pub injector: InjectorConfig,
}

impl Config {
  /// Load `path`, falling back to defaults when the file does not exist.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
      Ok(content) => Self::from_yaml(&content),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        tracing::info!("[CONFIG] {} not found, using defaults", path.display());
        Ok(Self::default())
      }
      Err(e) => Err(Error::config(format!("cannot read {}: {}", path.display(), e))),
    }
  }

  /// Parse a YAML document; an empty document is the default configuration.
  pub fn from_yaml(content: &str) -> Result<Self> {
    if content.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(content)?)
  }

  /// The address to bind, with `:port` widened to all interfaces
  pub fn listen_addr(&self) -> String {
    let listen = self.server.listen.trim();
    if listen.starts_with(':') {
      format!("0.0.0.0{}", listen)
    } else {
      listen.to_string()
    }
  }

  /// Outbound client configured from the `upstream` section
  pub fn client(&self) -> Result<ForwardingClient> {
    self.client_builder()?.build()
  }

  fn client_builder(&self) -> Result<ClientBuilder> {
    let upstream = &self.upstream;
    let mut builder = ForwardingClient::builder()
      .danger_accept_invalid_certs(!upstream.verify_certs)
      .connect_timeout(upstream.connect_timeout_secs.map(Duration::from_secs))
      .timeout(upstream.timeout_secs.map(Duration::from_secs))
      .max_body_size(upstream.max_body_bytes);
    for path in &upstream.extra_roots {
      for cert in tls::load_certificates(path)? {
        builder = builder.add_root_certificate(cert);
      }
    }
    Ok(builder)
  }

  /// The store selected by the `store` section
  pub fn store(&self) -> Arc<dyn Store> {
    let ids = Arc::new(RandomIdGenerator::default());
    match self.store.kind {
      StoreKind::Memory => Arc::new(MemoryStore::new(ids)),
      StoreKind::File => Arc::new(FileStore::new(self.store.dir.clone(), ids)),
    }
  }

  /// The leaf cache, when enabled
  pub fn leaf_cache(&self) -> Option<LeafCache> {
    self
      .ca
      .cache_leaves
      .then(|| LeafCache::new(self.ca.cache_capacity))
  }

  pub fn tunnel_options(&self) -> TunnelOptions {
    TunnelOptions {
      capture: self.tunnel.capture,
      max_capture_bytes: self.tunnel.max_capture_bytes,
      idle_timeout: self.tunnel.idle_timeout_secs.map(Duration::from_secs),
      close_grace: Duration::from_millis(self.tunnel.close_grace_millis),
    }
  }

  /// Drain deadline for [`ProxyServer::run_until`](crate::ProxyServer::run_until)
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.server.shutdown_grace_secs)
  }
}
