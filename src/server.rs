//! Listener and per-connection dispatch

use crate::ca::{CertificateAuthority, LeafCache, LeafIssuer};
use crate::client::{ClientBuilder, ForwardingClient};
use crate::codec;
use crate::errors::{Error, Result};
use crate::injector::Injector;
use crate::relay::{Relay, PROXY_CONNECTION};
use crate::store::Store;
use crate::tunnel::{Tunnel, TunnelOptions, TunnelOutcome};
use bytes::Bytes;
use http::header::CONNECTION;
use http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};

const INJECT_PREFIX: &str = "/inject/";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live tunnel bookkeeping shared by the server and its tunnels
#[derive(Clone, Debug)]
pub struct SessionRegistry {
  inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
  live: AtomicUsize,
  idle: Notify,
  closing: AtomicBool,
  close: Notify,
  outcomes: broadcast::Sender<TunnelOutcome>,
}

impl Default for SessionRegistry {
  fn default() -> Self {
    let (outcomes, _) = broadcast::channel(64);
    Self {
      inner: Arc::new(RegistryInner {
        live: AtomicUsize::new(0),
        idle: Notify::new(),
        closing: AtomicBool::new(false),
        close: Notify::new(),
        outcomes,
      }),
    }
  }
}

impl SessionRegistry {
  /// Number of tunnels still running
  pub fn live(&self) -> usize {
    self.inner.live.load(Ordering::SeqCst)
  }

  /// Receive the outcome of every tunnel that ends from now on
  pub fn subscribe(&self) -> broadcast::Receiver<TunnelOutcome> {
    self.inner.outcomes.subscribe()
  }

  pub(crate) fn enter(&self) -> SessionGuard {
    self.inner.live.fetch_add(1, Ordering::SeqCst);
    SessionGuard {
      registry: self.clone(),
    }
  }

  /// Ask every live tunnel, and any started later, to close now.
  pub fn close_all(&self) {
    self.inner.closing.store(true, Ordering::SeqCst);
    self.inner.close.notify_waiters();
  }

  /// Resolve once [`close_all`](Self::close_all) has been called.
  pub async fn closed(&self) {
    loop {
      let notified = self.inner.close.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.inner.closing.load(Ordering::SeqCst) {
        return;
      }
      notified.await;
    }
  }

  /// Resolve once no tunnel is live.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.live() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// Marks one live tunnel; dropping it ends the session
#[derive(Debug)]
pub(crate) struct SessionGuard {
  registry: SessionRegistry,
}

impl SessionGuard {
  /// Resolve when the server wants this session gone
  pub(crate) async fn cancelled(&self) {
    self.registry.closed().await
  }

  /// Publish the outcome and end the session
  pub(crate) fn finish(self, outcome: TunnelOutcome) {
    // subscribers must already see the session gone
    let registry = self.registry.clone();
    drop(self);
    let _ = registry.inner.outcomes.send(outcome);
  }
}

impl Drop for SessionGuard {
  fn drop(&mut self) {
    if self.registry.inner.live.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.registry.inner.idle.notify_waiters();
    }
  }
}

/// Builder for `ProxyServer`.
#[derive(Default)]
pub struct ProxyServerBuilder {
  authority: Option<Arc<CertificateAuthority>>,
  leaf_cache: Option<LeafCache>,
  client: Option<ForwardingClient>,
  client_config: Option<Box<dyn Fn(ClientBuilder) -> ClientBuilder + Send + Sync>>,
  store: Option<Arc<dyn Store>>,
  tunnel_options: TunnelOptions,
  injector: bool,
  payloads: Option<(String, String)>,
  max_request_body: Option<usize>,
  shutdown_grace: Option<Duration>,
}

impl ProxyServerBuilder {
  /// Set the signing authority. Required.
  pub fn authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
    self.authority = Some(authority);
    self
  }

  /// Reuse leaves per host
  pub fn leaf_cache(mut self, cache: LeafCache) -> Self {
    self.leaf_cache = Some(cache);
    self
  }

  /// Provide a fully constructed `ForwardingClient` to use.
  pub fn client(mut self, client: ForwardingClient) -> Self {
    self.client = Some(client);
    self
  }

  /// Configure the internal `ForwardingClient` using a closure that accepts a
  /// `ClientBuilder` and returns a configured `ClientBuilder`.
  pub fn configure_client<F>(mut self, f: F) -> Self
  where
    F: Fn(ClientBuilder) -> ClientBuilder + Send + Sync + 'static,
  {
    self.client_config = Some(Box::new(f));
    self
  }

  /// Record exchanges into `store`
  pub fn store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn tunnel_options(mut self, options: TunnelOptions) -> Self {
    self.tunnel_options = options;
    self
  }

  /// Serve `GET /inject/<id>` (needs a store)
  pub fn injector(mut self, enabled: bool) -> Self {
    self.injector = enabled;
    self
  }

  /// Payloads used by the injector
  pub fn payloads(mut self, path_payload: impl Into<String>, value_payload: impl Into<String>) -> Self {
    self.payloads = Some((path_payload.into(), value_payload.into()));
    self
  }

  /// Refuse client request bodies larger than `max` bytes
  pub fn max_request_body(mut self, max: impl Into<Option<usize>>) -> Self {
    self.max_request_body = max.into();
    self
  }

  /// How long [`ProxyServer::run_until`] waits for live tunnels before
  /// closing them. Default is 5 seconds.
  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = Some(grace);
    self
  }

  fn dispatcher(self) -> Result<(Dispatcher, SessionRegistry)> {
    let authority = self
      .authority
      .ok_or_else(|| Error::config("a certificate authority is required"))?;
    let client = match (self.client, self.client_config) {
      (Some(client), _) => client,
      (None, Some(configure)) => configure(ForwardingClient::builder()).build()?,
      (None, None) => ForwardingClient::builder().build()?,
    };
    let issuer = match self.leaf_cache {
      Some(cache) => LeafIssuer::with_cache(authority, cache),
      None => LeafIssuer::new(authority),
    };

    let registry = SessionRegistry::default();
    let mut tunnel = Tunnel::new(issuer, client.clone())
      .with_registry(registry.clone())
      .with_options(self.tunnel_options);
    let mut relay = Relay::new(client.clone());
    let mut injector = None;
    if let Some(store) = self.store {
      tunnel = tunnel.with_store(store.clone());
      relay = relay.with_store(store.clone());
      if self.injector {
        let mut inj = Injector::new(store, client);
        if let Some((path, value)) = self.payloads {
          inj = inj.with_payloads(path, value);
        }
        injector = Some(inj);
      }
    } else if self.injector {
      tracing::warn!("[SERVER] injector needs a store, leaving it disabled");
    }

    Ok((
      Dispatcher {
        relay,
        tunnel,
        injector,
        max_request_body: self.max_request_body,
      },
      registry,
    ))
  }

  /// Bind the listening socket and build the `ProxyServer`.
  pub async fn bind(self, addr: &str) -> Result<ProxyServer> {
    let shutdown_grace = self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE);
    let (dispatcher, registry) = self.dispatcher()?;
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
      addr: addr.to_string(),
      source,
    })?;
    let local_addr = listener.local_addr()?;
    tracing::info!("[SERVER] listening on {}", local_addr);
    Ok(ProxyServer {
      listener,
      local_addr,
      dispatcher: Arc::new(dispatcher),
      registry,
      shutdown_grace,
    })
  }
}

/// Intercepting proxy listener
pub struct ProxyServer {
  listener: TcpListener,
  local_addr: SocketAddr,
  dispatcher: Arc<Dispatcher>,
  registry: SessionRegistry,
  shutdown_grace: Duration,
}

impl ProxyServer {
  /// Create a `ProxyServerBuilder`
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Live tunnel bookkeeping
  pub fn registry(&self) -> &SessionRegistry {
    &self.registry
  }

  /// Serve until the process ends
  pub async fn run(self) -> Result<()> {
    self.run_until(std::future::pending()).await
  }

  /// Serve until `shutdown` resolves, then wait for live tunnels to end.
  ///
  /// Tunnels still open after the shutdown grace period are closed.
  pub async fn run_until<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        accepted = self.listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
              if let Err(e) = dispatcher.serve_connection(stream, peer_addr).await {
                tracing::debug!("[SERVER] connection from {} ended: {}", peer_addr, e);
              }
            });
          }
          Err(e) => {
            tracing::error!("[SERVER] Failed to accept connection: {}", e);
          }
        }
      }
    }
    tracing::info!(
      "[SERVER] shutting down, waiting for {} tunnel(s)",
      self.registry.live()
    );
    drop(self.listener);
    if tokio::time::timeout(self.shutdown_grace, self.registry.wait_idle())
      .await
      .is_err()
    {
      tracing::warn!(
        "[SERVER] closing {} tunnel(s) still open after {:?}",
        self.registry.live(),
        self.shutdown_grace
      );
      self.registry.close_all();
      self.registry.wait_idle().await;
    }
    Ok(())
  }
}

struct Dispatcher {
  relay: Relay,
  tunnel: Tunnel,
  injector: Option<Injector>,
  max_request_body: Option<usize>,
}

fn wants_keep_alive(request: &Request<Bytes>) -> bool {
  let tokens: Vec<String> = request
    .headers()
    .get_all(CONNECTION)
    .iter()
    .chain(request.headers().get_all(PROXY_CONNECTION).iter())
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|v| v.trim().to_ascii_lowercase())
    .collect();
  if tokens.iter().any(|t| t == "close") {
    return false;
  }
  request.version() == Version::HTTP_11 || tokens.iter().any(|t| t == "keep-alive")
}

fn response_closes(response: &Response<Bytes>) -> bool {
  response
    .headers()
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, status: StatusCode, reason: &str) -> Result<()> {
  let mut response = codec::simple_response(status, reason);
  response
    .headers_mut()
    .insert(CONNECTION, HeaderValue::from_static("close"));
  writer.write_all(&codec::response_to_raw(&response)).await?;
  writer.flush().await?;
  Ok(())
}

impl Dispatcher {
  async fn serve_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
      let request = match codec::read_request(&mut reader, self.max_request_body).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(Error::Io(e)) => return Err(Error::Io(e)),
        Err(e) => {
          write_error(reader.get_mut(), StatusCode::BAD_REQUEST, &e.to_string()).await.ok();
          return Err(e);
        }
      };
      tracing::debug!("[SERVER] {} {} {}", peer_addr, request.method(), request.uri());

      if request.method() == Method::CONNECT {
        let buffered = Bytes::copy_from_slice(reader.buffer());
        let stream = reader.into_inner();
        // the session runs on its own; the registry tracks it
        self.tunnel.handle_connect(stream, buffered, request.uri()).await?;
        return Ok(());
      }

      let keep_alive = wants_keep_alive(&request);
      let closes = if request.uri().scheme().is_none() {
        self.serve_local(request, reader.get_mut()).await?
      } else {
        // an error here means the client is gone, so there is no one to answer
        let response = self.relay.serve(request, reader.get_mut()).await?;
        response_closes(&response)
      };
      if !keep_alive || closes {
        reader.get_mut().shutdown().await.ok();
        return Ok(());
      }
    }
  }

  /// Origin-form requests addressed to the proxy itself
  async fn serve_local(&self, request: Request<Bytes>, writer: &mut TcpStream) -> Result<bool> {
    let path = request.uri().path();
    let (Some(injector), Some(id)) = (&self.injector, path.strip_prefix(INJECT_PREFIX)) else {
      write_error(writer, StatusCode::BAD_REQUEST, "this is a proxy, send absolute-form requests").await?;
      return Ok(true);
    };
    match injector.inject(id).await {
      Ok(mut response) => {
        let len = response.body().len();
        codec::set_content_length(response.headers_mut(), len);
        writer.write_all(&codec::response_to_raw(&response)).await?;
        writer.flush().await?;
        Ok(response_closes(&response))
      }
      Err(Error::NotFound(id)) => {
        write_error(writer, StatusCode::NOT_FOUND, &format!("no stored request {}", id)).await?;
        Ok(true)
      }
      Err(e) => {
        tracing::warn!("[INJECT] {} failed: {}", id, e);
        write_error(writer, StatusCode::BAD_GATEWAY, &e.to_string()).await?;
        Ok(true)
      }
    }
  }
}
