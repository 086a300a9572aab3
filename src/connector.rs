use crate::errors::{Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  root_certificates: Vec<CertificateDer<'static>>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  overrides: HashMap<String, SocketAddr>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: true,
      root_certificates: vec![],
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      keepalive: false,
      overrides: HashMap::new(),
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// Without validation *any* certificate for *any* site is trusted,
  /// including expired ones.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Adds a certificate to the set of roots that the connector will trust.
  pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> ConnectorBuilder {
    self.root_certificates.push(cert);
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Send connections for `host` to `addr` instead of resolving it.
  ///
  /// A port of 0 in `addr` keeps the port requested by the caller.
  pub fn resolve(mut self, host: &str, addr: SocketAddr) -> ConnectorBuilder {
    self.overrides.insert(host.to_ascii_lowercase(), addr);
    self
  }

  /// Combine the configuration of this builder into a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = TlsConnector::from(tls::client_config(
      self.certs_verification,
      &self.root_certificates,
    )?);
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      overrides: Arc::new(self.overrides.clone()),
      tls,
    })
  }
}

/// Dials origins over TCP, upgrading to TLS on request.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  overrides: Arc<HashMap<String, SocketAddr>>,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .field("overrides", &self.overrides)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Candidate addresses for `host:port`, honouring overrides
  async fn addresses(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let bare = host.trim_matches(['[', ']']);
    if let Some(addr) = self.overrides.get(&bare.to_ascii_lowercase()) {
      let mut addr = *addr;
      if addr.port() == 0 {
        addr.set_port(port);
      }
      return Ok(vec![addr]);
    }
    if let Ok(ip) = bare.parse() {
      return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port))
      .await
      .map_err(|e| Error::upstream_unavailable(format!("cannot resolve {}: {}", bare, e)))?
      .collect();
    if addrs.is_empty() {
      return Err(Error::upstream_unavailable(format!("{} has no addresses", bare)));
    }
    Ok(addrs)
  }

  /// Open a TCP connection to `host:port`, trying each resolved address in turn.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let mut last_error = None;
    for addr in self.addresses(host, port).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("[UPSTREAM] connect to {} failed: {}", addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(Error::upstream_unavailable(format!(
      "cannot connect to {}:{}: {}",
      host,
      port,
      last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
  }

  /// Open a TLS connection to `host:port`, sending `host` as SNI.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<Socket> {
    let socket = self.connect(host, port).await?;
    self.upgrade_to_tls(socket, host).await
  }

  /// Run a client handshake over an established connection.
  pub async fn upgrade_to_tls(&self, stream: Socket, host: &str) -> Result<Socket> {
    let domain = tls::server_name(host)?;
    let this = self.tls.clone();
    let handshake = stream.tls(move |t| async move { this.connect(domain, t).await });
    let tls = match self.connect_timeout {
      None => handshake.await,
      Some(timeout) => tokio::time::timeout(timeout, handshake)
        .await
        .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"))),
    };
    tls.map_err(|e| Error::upstream_unavailable(format!("TLS handshake with {} failed: {}", host, e)))
  }
}
