//! Plain HTTP forwarding
use crate::client::ForwardingClient;
use crate::codec;
use crate::errors::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};
use crate::store::{record_exchange, Store};
use bytes::Bytes;
use http::header::CONNECTION;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Headers meant for the proxy itself, never forwarded
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Remove the headers that only concern the hop between client and proxy.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
  headers.remove(PROXY_CONNECTION);
}

/// Forwards absolute-form requests through the [`ForwardingClient`]
#[derive(Clone)]
pub struct Relay {
  client: ForwardingClient,
  store: Option<Arc<dyn Store>>,
}

impl Relay {
  pub fn new(client: ForwardingClient) -> Self {
    Self { client, store: None }
  }

  /// Record every relayed exchange into `store`
  pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  /// Forward `request`, write the response to `client` and record the exchange.
  ///
  /// When the origin cannot be reached the client gets a `502` (`400` for a
  /// request that cannot be forwarded) with `Connection: close`, and that
  /// response is returned. An error means writing to `client` failed and the
  /// connection is no longer usable.
  pub async fn serve<W>(&self, mut request: Request<Bytes>, client: &mut W) -> Result<Response<Bytes>>
  where
    W: AsyncWrite + Unpin,
  {
    strip_hop_headers(request.headers_mut());
    let record = self
      .store
      .as_ref()
      .map(|_| RequestRecord::capture(&request, "http", None));
    tracing::debug!("[RELAY] {} {}", request.method(), request.uri());
    let response = match self.client.execute(request).await {
      Ok(response) => response,
      Err(e) => {
        let response = failure_response(&e);
        client.write_all(&codec::response_to_raw(&response)).await?;
        client.flush().await?;
        return Ok(response);
      }
    };

    client.write_all(&codec::response_to_raw(&response)).await?;
    client.flush().await?;

    if let (Some(store), Some(record)) = (&self.store, record) {
      if let Err(e) = record_exchange(store.as_ref(), record, Some(ResponseRecord::capture(&response))).await {
        tracing::warn!("[RELAY] store write failed: {}", e);
      }
    }
    Ok(response)
  }
}

/// What the client hears when `error` kept a request from its origin
fn failure_response(error: &Error) -> Response<Bytes> {
  let status = match error {
    Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    _ => StatusCode::BAD_GATEWAY,
  };
  let mut response = codec::simple_response(status, &error.to_string());
  response
    .headers_mut()
    .insert(CONNECTION, HeaderValue::from_static("close"));
  response
}
