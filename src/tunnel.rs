//! HTTPS interception
//!
//! A CONNECT request is turned into two TLS legs: the client's, terminated
//! here with a leaf minted for the CONNECT host, and the origin's, opened by
//! the [`ForwardingClient`]'s connector. Bytes are then copied both ways by
//! two pumps until either side goes away.
//!
//! Until the `200 Connection established` line is written, failures are
//! answered with a status (`400` for a bad target, `503` when no leaf can be
//! issued or the origin cannot be reached). After that the connection
//! belongs to the tunnel and failures just close both ends.
//!
//! Once either side closes, the other direction gets
//! [`TunnelOptions::close_grace`] to finish, then both connections are dropped.
use crate::ca::LeafIssuer;
use crate::capture::{self, CaptureReport, Tee};
use crate::client::ForwardingClient;
use crate::codec;
use crate::errors::{Error, Result};
use crate::server::{SessionGuard, SessionRegistry};
use crate::socket::{Hijacked, Socket};
use crate::store::Store;
use crate::tls::{self, LeafResolver};
use bytes::Bytes;
use http::header::CONNECTION;
use http::{HeaderValue, StatusCode, Uri};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Exact reply to an accepted CONNECT
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const DEFAULT_TLS_PORT: u16 = 443;
const COPY_BUFFER: usize = 16 * 1024;

/// Tunnel behaviour knobs
#[derive(Clone, Debug)]
pub struct TunnelOptions {
  /// Decode and store exchanges when a store is configured
  pub capture: bool,
  /// Largest message body capture will decode
  pub max_capture_bytes: Option<usize>,
  /// Abort a direction whose read stalls this long
  pub idle_timeout: Option<Duration>,
  /// How long the other direction may run after one side has closed
  pub close_grace: Duration,
}

impl Default for TunnelOptions {
  fn default() -> Self {
    Self {
      capture: true,
      max_capture_bytes: Some(8 * 1024 * 1024),
      idle_timeout: None,
      close_grace: Duration::from_secs(2),
    }
  }
}

/// How a tunnel ended
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelOutcome {
  /// CONNECT target, `host:port`
  pub target: String,
  /// cleartext bytes copied from the client to the origin
  pub bytes_from_client: u64,
  /// cleartext bytes copied from the origin to the client
  pub bytes_from_origin: u64,
  /// why the tunnel never carried data, if it did not
  pub error: Option<String>,
  pub capture: CaptureReport,
}

/// Completion signal of one tunnel session
#[derive(Debug)]
pub struct TunnelHandle {
  target: String,
  task: JoinHandle<TunnelOutcome>,
}

impl TunnelHandle {
  /// CONNECT target, `host:port`
  pub fn target(&self) -> &str {
    &self.target
  }

  /// Whether both copy directions have ended
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for both directions to end.
  pub async fn wait(self) -> TunnelOutcome {
    match self.task.await {
      Ok(outcome) => outcome,
      Err(e) => TunnelOutcome {
        target: self.target,
        error: Some(format!("tunnel task failed: {}", e)),
        ..Default::default()
      },
    }
  }
}

/// Split a CONNECT request-target into host and port.
pub fn connect_target(uri: &Uri) -> Result<(String, u16)> {
  let authority = uri
    .authority()
    .ok_or_else(|| Error::invalid_request(format!("CONNECT target {} has no authority", uri)))?;
  let host = authority.host();
  if host.is_empty() || host == "[]" {
    return Err(Error::invalid_request(format!("CONNECT target {} has no host", uri)));
  }
  Ok((host.to_string(), authority.port_u16().unwrap_or(DEFAULT_TLS_PORT)))
}

/// Intercepts CONNECT requests
#[derive(Clone)]
pub struct Tunnel {
  issuer: LeafIssuer,
  client: ForwardingClient,
  store: Option<Arc<dyn Store>>,
  registry: SessionRegistry,
  options: TunnelOptions,
}

impl Tunnel {
  pub fn new(issuer: LeafIssuer, client: ForwardingClient) -> Self {
    Self {
      issuer,
      client,
      store: None,
      registry: SessionRegistry::default(),
      options: TunnelOptions::default(),
    }
  }

  /// Capture decoded exchanges into `store`
  pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  /// Track sessions in `registry`
  pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn with_options(mut self, options: TunnelOptions) -> Self {
    self.options = options;
    self
  }

  /// Sessions started by this tunnel
  pub fn registry(&self) -> &SessionRegistry {
    &self.registry
  }

  /// Take over `stream`, on which a CONNECT for `target` has just been read.
  ///
  /// `buffered` holds any bytes already read past the CONNECT head. On
  /// success the returned handle resolves once the session has ended. On
  /// error the client has been answered and `stream` is dropped.
  pub async fn handle_connect<S>(&self, mut stream: S, buffered: Bytes, target: &Uri) -> Result<TunnelHandle>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let (host, port) = match connect_target(target) {
      Ok(target) => target,
      Err(e) => {
        reject(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await;
        return Err(e);
      }
    };
    let authority = format!("{}:{}", host, port);

    let leaf = match self.issuer.certified_key(&host) {
      Ok(leaf) => leaf,
      Err(e) => {
        reject(&mut stream, StatusCode::SERVICE_UNAVAILABLE, "no certificate for target").await;
        return Err(e);
      }
    };

    let origin = match self.client.connect_tunnel(&host, port).await {
      Ok(origin) => origin,
      Err(e) => {
        tracing::info!("[TUNNEL] {} unreachable: {}", authority, e);
        reject(&mut stream, StatusCode::SERVICE_UNAVAILABLE, "origin unreachable").await;
        return Err(e);
      }
    };

    let acceptor = match tls::server_config(LeafResolver::new(host.as_str(), leaf, self.issuer.clone())) {
      Ok(config) => TlsAcceptor::from(config),
      Err(e) => {
        reject(&mut stream, StatusCode::SERVICE_UNAVAILABLE, "TLS setup failed").await;
        return Err(e);
      }
    };

    // from here on only raw bytes can be sent to the client
    let mut client = Hijacked::new(buffered, stream);
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    tracing::debug!("[TUNNEL] established {}", authority);

    let guard = self.registry.enter();
    let (client_tee, origin_tee, capture) = match (&self.store, self.options.capture) {
      (Some(store), true) => {
        let (c, o, h) = capture::spawn(store.clone(), authority.clone(), self.options.max_capture_bytes);
        (c, o, Some(h))
      }
      _ => (Tee::disabled(), Tee::disabled(), None),
    };
    let session = Session {
      target: authority.clone(),
      idle_timeout: self.options.idle_timeout,
      close_grace: self.options.close_grace,
      guard,
    };
    let task = tokio::spawn(session.run(acceptor, client, origin, client_tee, origin_tee, capture));
    Ok(TunnelHandle {
      target: authority,
      task,
    })
  }
}

async fn reject<S: AsyncWrite + Unpin>(stream: &mut S, status: StatusCode, reason: &str) {
  let mut response = codec::simple_response(status, reason);
  response
    .headers_mut()
    .insert(CONNECTION, HeaderValue::from_static("close"));
  let raw = codec::response_to_raw(&response);
  if let Err(e) = stream.write_all(&raw).await {
    tracing::debug!("[TUNNEL] could not send {}: {}", status, e);
    return;
  }
  stream.shutdown().await.ok();
}

struct Session {
  target: String,
  idle_timeout: Option<Duration>,
  close_grace: Duration,
  guard: SessionGuard,
}

impl Session {
  async fn run<S>(
    self,
    acceptor: TlsAcceptor,
    client: Hijacked<S>,
    mut origin: Socket,
    client_tee: Tee,
    origin_tee: Tee,
    capture: Option<JoinHandle<CaptureReport>>,
  ) -> TunnelOutcome
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let mut outcome = TunnelOutcome {
      target: self.target.clone(),
      ..Default::default()
    };

    let accepted = tokio::select! {
      accepted = acceptor.accept(client) => accepted,
      _ = self.guard.cancelled() => Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "proxy shutting down")),
    };
    match accepted {
      Ok(client) => {
        let (client_read, client_write) = tokio::io::split(client);
        let (origin_read, origin_write) = tokio::io::split(origin);
        let up = AtomicU64::new(0);
        let down = AtomicU64::new(0);
        let upstream = pump(client_read, origin_write, client_tee, self.idle_timeout, &up);
        let downstream = pump(origin_read, client_write, origin_tee, self.idle_timeout, &down);
        tokio::pin!(upstream, downstream);
        tokio::select! {
          _ = &mut upstream => self.linger(downstream, "client").await,
          _ = &mut downstream => self.linger(upstream, "origin").await,
          _ = self.guard.cancelled() => tracing::debug!("[TUNNEL] closing {} for shutdown", self.target),
        }
        outcome.bytes_from_client = up.load(Ordering::Relaxed);
        outcome.bytes_from_origin = down.load(Ordering::Relaxed);
      }
      Err(e) => {
        tracing::debug!("[TUNNEL] client handshake for {} failed: {}", self.target, e);
        outcome.error = Some(format!("client handshake failed: {}", e));
        drop(client_tee);
        drop(origin_tee);
        origin.shutdown().await.ok();
      }
    }

    if let Some(capture) = capture {
      outcome.capture = capture.await.unwrap_or_else(|e| CaptureReport {
        failure: Some(format!("capture task failed: {}", e)),
        ..Default::default()
      });
    }
    tracing::debug!(
      "[TUNNEL] closed {} ({} bytes up, {} bytes down)",
      outcome.target,
      outcome.bytes_from_client,
      outcome.bytes_from_origin
    );
    self.guard.finish(outcome.clone());
    outcome
  }

  /// Give the direction still flowing towards `towards` the grace period to finish.
  async fn linger<F: Future<Output = ()>>(&self, direction: F, towards: &str) {
    tokio::select! {
      finished = tokio::time::timeout(self.close_grace, direction) => {
        if finished.is_err() {
          tracing::debug!("[TUNNEL] {} still open towards the {}, dropping it", self.target, towards);
        }
      }
      _ = self.guard.cancelled() => {}
    }
  }
}

/// Copy `reader` into `writer` until EOF or error, then shut `writer` down.
///
/// `moved` counts the bytes written so far.
async fn pump<R, W>(mut reader: R, mut writer: W, mut tee: Tee, idle_timeout: Option<Duration>, moved: &AtomicU64)
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; COPY_BUFFER];
  loop {
    let read = match idle_timeout {
      Some(t) => match tokio::time::timeout(t, reader.read(&mut buf)).await {
        Ok(read) => read,
        Err(_) => {
          tracing::debug!("[TUNNEL] idle for {:?}, closing direction", t);
          break;
        }
      },
      None => reader.read(&mut buf).await,
    };
    let n = match read {
      Ok(0) => break,
      Ok(n) => n,
      Err(e) => {
        tracing::debug!("[TUNNEL] read ended: {}", e);
        break;
      }
    };
    tee.feed(&buf[..n]);
    if let Err(e) = writer.write_all(&buf[..n]).await {
      tracing::debug!("[TUNNEL] write ended: {}", e);
      break;
    }
    moved.fetch_add(n as u64, Ordering::Relaxed);
  }
  writer.shutdown().await.ok();
}
