use crate::codec::{self, Framing};
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{Error, Result};
use crate::socket::Socket;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Issues proxied requests to origins.
///
/// Every request goes out on its own connection as HTTP/1.1 and exactly one
/// response is read back. Redirects are never followed; a 3xx is handed to the
/// caller as the origin sent it.
///
/// ```rust,no_run
/// # async fn run() -> trebuchet::Result<()> {
/// let client = trebuchet::ForwardingClient::builder()
///   .timeout(std::time::Duration::from_secs(10))
///   .build()?;
/// let request = http::Request::get("http://example.test/").body(bytes::Bytes::new())?;
/// let response = client.execute(request).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ForwardingClient {
  inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
  connector: Connector,
  max_body_size: Option<usize>,
}

impl ForwardingClient {
  /// Creates a `ClientBuilder` to configure a `ForwardingClient`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::new()
  }

  /// Open a TLS connection to an origin, presenting `host` as SNI.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<Socket> {
    self.inner.connector.connect_tls(host, port).await
  }

  /// Like [`connect_tls`](Self::connect_tls), but the returned socket has no
  /// read or write deadline. Only dialing and the handshake are bounded.
  pub async fn connect_tunnel(&self, host: &str, port: u16) -> Result<Socket> {
    Ok(self.connect_tls(host, port).await?.without_timeouts())
  }

  /// Send `request`, whose URI must be absolute (`http` or `https`), and read the response.
  ///
  /// Chunked and close-delimited response bodies come back re-framed with a
  /// `Content-Length`.
  pub async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
    let uri = request.uri();
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("no host in {}", uri)))?;
    let (tls, default_port) = match uri.scheme_str() {
      Some("http") => (false, 80),
      Some("https") => (true, 443),
      Some(other) => return Err(Error::invalid_request(format!("unsupported scheme {}", other))),
      None => return Err(Error::invalid_request(format!("{} is not absolute", uri))),
    };
    let port = uri.port_u16().unwrap_or(default_port);
    tracing::debug!("[CLIENT] {} {}", request.method(), uri);
    let socket = if tls {
      self.inner.connector.connect_tls(host, port).await?
    } else {
      self.inner.connector.connect(host, port).await?
    };
    self.execute_request(socket, &request).await
  }

  /// Send `request` over an already established connection.
  pub async fn execute_request(&self, mut socket: Socket, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let raw = codec::request_to_raw(request);
    socket
      .write_all(&raw)
      .await
      .map_err(|e| Error::upstream_unavailable(format!("write to origin failed: {}", e)))?;
    socket
      .flush()
      .await
      .map_err(|e| Error::upstream_unavailable(format!("write to origin failed: {}", e)))?;

    let mut reader = BufReader::new(socket);
    loop {
      let (mut response, framing) = codec::read_response(&mut reader, request.method(), self.inner.max_body_size)
        .await
        .map_err(|e| match e {
          Error::Io(io) => Error::upstream_unavailable(format!("read from origin failed: {}", io)),
          other => other,
        })?;
      if response.status().is_informational() && response.status() != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!("[CLIENT] skipping interim {}", response.status());
        continue;
      }
      if matches!(framing, Framing::Chunked | Framing::UntilClose) {
        let len = response.body().len();
        codec::set_content_length(response.headers_mut(), len);
      }
      return Ok(response);
    }
  }
}

/// A `ClientBuilder` can be used to create a `ForwardingClient` with custom configuration.
#[derive(Clone, Debug)]
pub struct ClientBuilder {
  config: Config,
}

#[derive(Clone, Debug)]
struct Config {
  timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certs_verification: bool,
  root_certificates: Vec<CertificateDer<'static>>,
  overrides: Vec<(String, SocketAddr)>,
  max_body_size: Option<usize>,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientBuilder {
  /// Constructs a new `ClientBuilder`.
  pub fn new() -> ClientBuilder {
    ClientBuilder {
      config: Config {
        timeout: Some(Duration::from_secs(30)),
        connect_timeout: Some(Duration::from_secs(10)),
        nodelay: true,
        keepalive: false,
        certs_verification: true,
        root_certificates: vec![],
        overrides: vec![],
        max_body_size: None,
      },
    }
  }

  /// Returns a `ForwardingClient` that uses this `ClientBuilder` configuration.
  ///
  /// # Errors
  ///
  /// This method fails if the TLS client configuration cannot be built.
  pub fn build(self) -> Result<ForwardingClient> {
    let config = self.config;
    let mut connector = ConnectorBuilder::default()
      .read_timeout(config.timeout)
      .write_timeout(config.timeout)
      .connect_timeout(config.connect_timeout)
      .nodelay(config.nodelay)
      .keepalive(config.keepalive)
      .certs_verification(config.certs_verification);
    for cert in config.root_certificates {
      connector = connector.add_root_certificate(cert);
    }
    for (host, addr) in &config.overrides {
      connector = connector.resolve(host, *addr);
    }
    Ok(ForwardingClient {
      inner: Arc::new(ClientRef {
        connector: connector.build()?,
        max_body_size: config.max_body_size,
      }),
    })
  }

  /// Read/write timeout applied to each socket operation.
  ///
  /// Default is 30 seconds.
  pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> ClientBuilder {
    self.config.timeout = timeout.into();
    self
  }

  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> ClientBuilder {
    self.config.connect_timeout = timeout.into();
    self
  }

  /// Set whether sockets have `TCP_NODELAY` enabled.
  ///
  /// Default is `true`.
  pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
    self.config.nodelay = enabled;
    self
  }

  /// Set `SO_KEEPALIVE` on outbound sockets.
  pub fn tcp_keepalive(mut self, enabled: bool) -> ClientBuilder {
    self.config.keepalive = enabled;
    self
  }

  /// Add a custom root certificate.
  ///
  /// This can be used to connect to a server that has a self-signed
  /// certificate for example.
  pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> ClientBuilder {
    self.config.root_certificates.push(cert);
    self
  }

  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use. This includes expired certificates.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.config.certs_verification = !accept_invalid_certs;
    self
  }

  /// Override DNS resolution for `host`. A port of 0 keeps the requested port.
  pub fn resolve(mut self, host: &str, addr: SocketAddr) -> ClientBuilder {
    self.config.overrides.push((host.to_string(), addr));
    self
  }

  /// Refuse response bodies larger than `max` bytes.
  pub fn max_body_size(mut self, max: impl Into<Option<usize>>) -> ClientBuilder {
    self.config.max_body_size = max.into();
    self
  }
}
