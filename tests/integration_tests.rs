//! Integration tests for trebuchet

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use trebuchet::tls::{self, LeafResolver};
use trebuchet::{
  codec, CertificateAuthority, LeafIssuer, MemoryStore, Method, ProxyServer, ProxyServerBuilder, SessionRegistry,
  StatusCode, Store, CONNECT_ESTABLISHED,
};
use x509_parser::prelude::*;

const WAIT: Duration = Duration::from_secs(10);
const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: real\r\n\r\nhello";

struct RunningProxy {
  addr: SocketAddr,
  registry: SessionRegistry,
  shutdown: oneshot::Sender<()>,
  task: JoinHandle<trebuchet::Result<()>>,
}

async fn start_proxy(builder: ProxyServerBuilder) -> RunningProxy {
  let server = builder.bind("127.0.0.1:0").await.unwrap();
  let addr = server.local_addr();
  let registry = server.registry().clone();
  let (shutdown, rx) = oneshot::channel();
  let task = tokio::spawn(server.run_until(async {
    rx.await.ok();
  }));
  RunningProxy {
    addr,
    registry,
    shutdown,
    task,
  }
}

async fn dead_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  port
}

/// TLS origin for `example.test` signed by its own authority.
///
/// Every accepted connection is handed to `serve`.
async fn tls_origin<F, Fut>(origin_ca: Arc<CertificateAuthority>, serve: F) -> SocketAddr
where
  F: Fn(tokio_rustls::server::TlsStream<TcpStream>) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = ()> + Send + 'static,
{
  let issuer = LeafIssuer::new(origin_ca);
  let leaf = issuer.certified_key("example.test").unwrap();
  let config = tls::server_config(LeafResolver::new("example.test", leaf, issuer)).unwrap();
  let acceptor = TlsAcceptor::from(config);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serve = Arc::new(serve);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let serve = serve.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          serve(tls).await;
        }
      });
    }
  });
  addr
}

/// Proxy whose outbound client trusts `origin_ca` and sends `example.test` to `origin`.
fn proxy_builder(proxy_ca: Arc<CertificateAuthority>, origin_ca: &CertificateAuthority, origin: SocketAddr) -> ProxyServerBuilder {
  let origin_root = origin_ca.ca_cert_der().clone();
  ProxyServer::builder()
    .authority(proxy_ca)
    .configure_client(move |builder| {
      builder
        .add_root_certificate(origin_root.clone())
        .resolve("example.test", origin)
    })
}

/// CONNECT through the proxy and complete TLS as a client trusting `proxy_ca`.
async fn connect_through(
  proxy: SocketAddr,
  proxy_ca: &CertificateAuthority,
) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
    .await
    .unwrap();
  let mut established = vec![0u8; CONNECT_ESTABLISHED.len()];
  stream.read_exact(&mut established).await.unwrap();
  assert_eq!(established, CONNECT_ESTABLISHED);

  let mut roots = RootCertStore::empty();
  roots.add(proxy_ca.ca_cert_der().clone()).unwrap();
  let config = ClientConfig::builder_with_provider(tls::crypto_provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  connector
    .connect(tls::server_name("example.test").unwrap(), stream)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_root_survives_restart() {
  let temp_dir = std::env::temp_dir().join(format!("trebuchet-test-restart-{}", std::process::id()));
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let first = CertificateAuthority::bootstrap(&temp_dir).await.unwrap();
  let pem = std::fs::read_to_string(temp_dir.join(trebuchet::CA_CERT_FILE)).unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert_eq!(first.ca_cert_pem(), pem);

  let second = CertificateAuthority::bootstrap(&temp_dir).await.unwrap();
  let (_, a) = parse_x509_certificate(first.ca_cert_der()).unwrap();
  let (_, b) = parse_x509_certificate(second.ca_cert_der()).unwrap();
  assert_eq!(a.raw_serial(), b.raw_serial());
  assert_eq!(a.public_key().raw, b.public_key().raw);

  // a leaf from the second process validates against the first root
  let leaf = second.issue_leaf(&["example.test", "10.0.0.1"]).unwrap();
  let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
  assert!(cert.verify_signature(Some(a.public_key())).is_ok());
  assert_eq!(
    cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp(),
    24 * 60 * 60
  );

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_connect_to_dead_origin_is_503() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let proxy = start_proxy(ProxyServer::builder().authority(proxy_ca)).await;

  let port = dead_port().await;
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port, port).as_bytes())
    .await
    .unwrap();
  let mut reply = Vec::new();
  tokio::time::timeout(WAIT, stream.read_to_end(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert!(reply.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));
  assert!(!reply.windows(CONNECT_ESTABLISHED.len()).any(|w| w == CONNECT_ESTABLISHED));
  assert_eq!(proxy.registry.live(), 0);

  proxy.shutdown.send(()).ok();
  proxy.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tunnel_is_byte_faithful_both_ways() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin = tls_origin(origin_ca.clone(), |tls| async move {
    let (mut reader, mut writer) = tokio::io::split(tls);
    tokio::io::copy(&mut reader, &mut writer).await.ok();
    writer.shutdown().await.ok();
  })
  .await;
  let proxy = start_proxy(proxy_builder(proxy_ca.clone(), &origin_ca, origin)).await;
  let mut outcomes = proxy.registry.subscribe();

  let tls = connect_through(proxy.addr, &proxy_ca).await;
  let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
  let (mut reader, mut writer) = tokio::io::split(tls);
  let sent = payload.clone();
  let write = tokio::spawn(async move {
    writer.write_all(&sent).await.unwrap();
    writer.shutdown().await.unwrap();
  });
  let mut echoed = Vec::new();
  tokio::time::timeout(WAIT, reader.read_to_end(&mut echoed))
    .await
    .unwrap()
    .unwrap();
  write.await.unwrap();
  assert_eq!(echoed, payload);

  let outcome = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
  assert_eq!(outcome.target, "example.test:443");
  assert_eq!(outcome.bytes_from_client, payload.len() as u64);
  assert_eq!(outcome.bytes_from_origin, payload.len() as u64);
  assert_eq!(outcome.error, None);

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_example_test_scenario_with_capture() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin = tls_origin(origin_ca.clone(), |tls| async move {
    let mut reader = BufReader::new(tls);
    while let Ok(Some(_)) = codec::read_request(&mut reader, None).await {
      if reader.get_mut().write_all(ORIGIN_RESPONSE).await.is_err() {
        return;
      }
      reader.get_mut().flush().await.ok();
    }
    reader.get_mut().shutdown().await.ok();
  })
  .await;
  let store = Arc::new(MemoryStore::default());
  let proxy = start_proxy(proxy_builder(proxy_ca.clone(), &origin_ca, origin).store(store.clone())).await;
  let mut outcomes = proxy.registry.subscribe();

  let mut tls = connect_through(proxy.addr, &proxy_ca).await;
  {
    let (_, connection) = tls.get_ref();
    let presented = &connection.peer_certificates().unwrap()[0];
    let (_, cert) = parse_x509_certificate(presented).unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "example.test");
  }

  let request = b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n";
  tls.write_all(request).await.unwrap();
  let mut response = vec![0u8; ORIGIN_RESPONSE.len()];
  tokio::time::timeout(WAIT, tls.read_exact(&mut response))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response, ORIGIN_RESPONSE);
  tls.shutdown().await.unwrap();
  drop(tls);

  let outcome = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
  assert_eq!(outcome.bytes_from_client, request.len() as u64);
  assert_eq!(outcome.bytes_from_origin, ORIGIN_RESPONSE.len() as u64);
  assert_eq!(outcome.capture.recorded, 1);
  assert_eq!(outcome.capture.failure, None);

  let documents = store.documents().await;
  assert_eq!(documents.len(), 1);
  let document = &documents[0];
  assert_eq!(document.request.method, Method::GET);
  assert_eq!(document.request.url, "https://example.test/");
  let recorded = document.response.as_ref().unwrap();
  assert_eq!(recorded.status_code, StatusCode::OK);
  assert_eq!(recorded.body, "hello");
  assert_eq!(recorded.headers.get("x-origin").map(String::as_str), Some("real"));

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

/// Plain HTTP origin that reports every request it receives and answers with a redirect.
async fn redirecting_origin() -> (SocketAddr, mpsc::UnboundedReceiver<http::Request<Bytes>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        while let Ok(Some(request)) = codec::read_request(&mut reader, None).await {
          tx.send(request).ok();
          let response = b"HTTP/1.1 302 Found\r\nLocation: http://elsewhere.test/\r\nContent-Length: 8\r\n\r\nredirect";
          if reader.get_mut().write_all(response).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, rx)
}

#[tokio::test]
async fn test_relay_injector_round_trip() {
  let (origin, mut received) = redirecting_origin().await;
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let store = Arc::new(MemoryStore::default());
  let proxy = start_proxy(
    ProxyServer::builder()
      .authority(proxy_ca)
      .store(store.clone())
      .injector(true),
  )
  .await;

  let stream = TcpStream::connect(proxy.addr).await.unwrap();
  let mut client = BufReader::new(stream);
  let request = format!(
    "POST http://{origin}/submit?x=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nX-Custom: yes\r\nContent-Length: 5\r\n\r\nhello"
  );
  client.get_mut().write_all(request.as_bytes()).await.unwrap();

  // the redirect comes back unfollowed
  let (response, _) = tokio::time::timeout(WAIT, codec::read_response(&mut client, &Method::POST, None))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::FOUND);
  assert_eq!(response.headers()["location"], "http://elsewhere.test/");
  assert_eq!(response.body().as_ref(), b"redirect");

  let forwarded = received.recv().await.unwrap();
  assert_eq!(*forwarded.method(), Method::POST);
  assert_eq!(forwarded.uri().path(), "/submit");
  assert_eq!(forwarded.uri().query(), Some("x=1"));
  assert_eq!(forwarded.body().as_ref(), b"hello");
  assert_eq!(forwarded.headers()["x-custom"], "yes");
  assert!(forwarded.headers().get("proxy-connection").is_none());

  // recording happens after the response is written
  let id = tokio::time::timeout(WAIT, async {
    loop {
      if let Some(document) = store.documents().await.into_iter().next() {
        break document.request_id;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();
  let stored = store.get_by_request_id(&id).await.unwrap().unwrap();
  assert_eq!(stored.response.unwrap().status_code, StatusCode::FOUND);

  // same connection, replay through the injector
  client
    .get_mut()
    .write_all(format!("GET /inject/{} HTTP/1.1\r\nHost: proxy\r\n\r\n", id).as_bytes())
    .await
    .unwrap();
  let (response, _) = tokio::time::timeout(WAIT, codec::read_response(&mut client, &Method::GET, None))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::FOUND);

  let injected = received.recv().await.unwrap();
  assert_eq!(*injected.method(), Method::POST);
  assert_eq!(injected.uri().path(), "/submit'+OR+1=1--");
  assert_eq!(injected.headers()["x-custom"], "yes'");
  assert_eq!(injected.headers()["host"], origin.to_string());
  assert_eq!(injected.body().as_ref(), b"hello");

  // unknown ids are 404
  client
    .get_mut()
    .write_all(b"GET /inject/doesnotexist HTTP/1.1\r\nHost: proxy\r\n\r\n")
    .await
    .unwrap();
  let (response, _) = tokio::time::timeout(WAIT, codec::read_response(&mut client, &Method::GET, None))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::NOT_FOUND);

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_relay_failures_and_origin_form() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let proxy = start_proxy(ProxyServer::builder().authority(proxy_ca)).await;

  let port = dead_port().await;
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port, port).as_bytes())
    .await
    .unwrap();
  let mut reply = Vec::new();
  tokio::time::timeout(WAIT, stream.read_to_end(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(b"GET /not-a-proxy-request HTTP/1.1\r\nHost: proxy\r\n\r\n")
    .await
    .unwrap();
  let mut reply = Vec::new();
  tokio::time::timeout(WAIT, stream.read_to_end(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let proxy = start_proxy(ProxyServer::builder().authority(proxy_ca)).await;
  let addr = proxy.addr;
  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
  assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let result = ProxyServer::builder().authority(proxy_ca).bind(&addr).await;
  assert!(matches!(result, Err(trebuchet::Error::Bind { .. })));
}

#[tokio::test]
async fn test_chunked_request_reaches_origin_with_a_length() {
  let (origin, mut received) = redirecting_origin().await;
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let proxy = start_proxy(ProxyServer::builder().authority(proxy_ca)).await;

  let stream = TcpStream::connect(proxy.addr).await.unwrap();
  let mut client = BufReader::new(stream);
  let request = format!(
    "POST http://{origin}/up HTTP/1.1\r\nHost: {origin}\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n\
     PUT http://{origin}/empty HTTP/1.1\r\nHost: {origin}\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n"
  );
  client.get_mut().write_all(request.as_bytes()).await.unwrap();

  for _ in 0..2 {
    let (response, _) = tokio::time::timeout(WAIT, codec::read_response(&mut client, &Method::POST, None))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
  }

  let forwarded = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
  assert_eq!(forwarded.uri().path(), "/up");
  assert_eq!(forwarded.body().as_ref(), b"hello");
  assert_eq!(forwarded.headers()["content-length"], "5");
  assert!(forwarded.headers().get("transfer-encoding").is_none());

  let empty = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
  assert_eq!(empty.uri().path(), "/empty");
  assert!(empty.body().is_empty());
  assert_eq!(empty.headers()["content-length"], "0");
  assert!(empty.headers().get("transfer-encoding").is_none());

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_tunnel_outlives_the_upstream_timeout() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin = tls_origin(origin_ca.clone(), |tls| async move {
    let (mut reader, mut writer) = tokio::io::split(tls);
    tokio::io::copy(&mut reader, &mut writer).await.ok();
    writer.shutdown().await.ok();
  })
  .await;
  let origin_root = origin_ca.ca_cert_der().clone();
  let builder = ProxyServer::builder()
    .authority(proxy_ca.clone())
    .configure_client(move |builder| {
      builder
        .add_root_certificate(origin_root.clone())
        .resolve("example.test", origin)
        .timeout(Duration::from_millis(300))
    });
  let proxy = start_proxy(builder).await;

  let mut tls = connect_through(proxy.addr, &proxy_ca).await;
  let mut buf = [0u8; 5];
  tls.write_all(b"first").await.unwrap();
  tokio::time::timeout(WAIT, tls.read_exact(&mut buf)).await.unwrap().unwrap();
  assert_eq!(&buf, b"first");

  tokio::time::sleep(Duration::from_millis(800)).await;
  tls.write_all(b"again").await.unwrap();
  tokio::time::timeout(WAIT, tls.read_exact(&mut buf)).await.unwrap().unwrap();
  assert_eq!(&buf, b"again");
  assert_eq!(proxy.registry.live(), 1);

  tls.shutdown().await.unwrap();
  drop(tls);
  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_origin_close_ends_tunnel_while_client_is_quiet() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin = tls_origin(origin_ca.clone(), |mut tls| async move {
    tls.write_all(b"bye").await.ok();
    tls.shutdown().await.ok();
  })
  .await;
  let options = trebuchet::TunnelOptions {
    close_grace: Duration::from_millis(200),
    ..Default::default()
  };
  let proxy = start_proxy(proxy_builder(proxy_ca.clone(), &origin_ca, origin).tunnel_options(options)).await;
  let mut outcomes = proxy.registry.subscribe();

  let mut tls = connect_through(proxy.addr, &proxy_ca).await;
  let mut buf = [0u8; 3];
  tokio::time::timeout(WAIT, tls.read_exact(&mut buf)).await.unwrap().unwrap();
  assert_eq!(&buf, b"bye");

  // the client keeps its socket open and says nothing
  let outcome = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
  assert_eq!(outcome.bytes_from_origin, 3);
  assert_eq!(proxy.registry.live(), 0);

  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
  drop(tls);
}

#[tokio::test]
async fn test_shutdown_closes_tunnels_after_grace() {
  let proxy_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin_ca = Arc::new(CertificateAuthority::generate().unwrap());
  let origin = tls_origin(origin_ca.clone(), |tls| async move {
    let (mut reader, mut writer) = tokio::io::split(tls);
    tokio::io::copy(&mut reader, &mut writer).await.ok();
  })
  .await;
  let builder = proxy_builder(proxy_ca.clone(), &origin_ca, origin).shutdown_grace(Duration::from_millis(200));
  let proxy = start_proxy(builder).await;

  let mut tls = connect_through(proxy.addr, &proxy_ca).await;
  let mut buf = [0u8; 4];
  tls.write_all(b"open").await.unwrap();
  tokio::time::timeout(WAIT, tls.read_exact(&mut buf)).await.unwrap().unwrap();
  assert_eq!(proxy.registry.live(), 1);

  // neither side ever closes; shutdown must not wait for them
  proxy.shutdown.send(()).ok();
  tokio::time::timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
  assert_eq!(proxy.registry.live(), 0);

  let mut rest = Vec::new();
  let closed = tokio::time::timeout(WAIT, tls.read_to_end(&mut rest)).await.unwrap();
  assert!(closed.is_err() || rest.is_empty());
}
