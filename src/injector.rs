//! Replay of stored requests with an injected payload
//!
//! A stored request is rebuilt with the path payload appended to its path and
//! the value payload appended to every cookie and to every header that does
//! not carry framing or routing information, then sent to the origin again.
use crate::client::ForwardingClient;
use crate::errors::{Error, Result};
use crate::record::Document;
use crate::relay::PROXY_CONNECTION;
use crate::store::Store;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Request, Response, Uri};
use std::sync::Arc;

/// Default payload appended to the path
pub const DEFAULT_PATH_PAYLOAD: &str = "'+OR+1=1--";
/// Default payload appended to header and cookie values
pub const DEFAULT_VALUE_PAYLOAD: &str = "'";

/// Rebuilds and reissues stored requests
#[derive(Clone)]
pub struct Injector {
  store: Arc<dyn Store>,
  client: ForwardingClient,
  path_payload: String,
  value_payload: String,
}

impl Injector {
  pub fn new(store: Arc<dyn Store>, client: ForwardingClient) -> Self {
    Self {
      store,
      client,
      path_payload: DEFAULT_PATH_PAYLOAD.to_string(),
      value_payload: DEFAULT_VALUE_PAYLOAD.to_string(),
    }
  }

  /// Replace the injected payloads
  pub fn with_payloads(mut self, path_payload: impl Into<String>, value_payload: impl Into<String>) -> Self {
    self.path_payload = path_payload.into();
    self.value_payload = value_payload.into();
    self
  }

  /// Build the mutated request for `document`.
  pub fn prepare(&self, document: &Document) -> Result<Request<Bytes>> {
    let record = &document.request;
    let stored: Uri = record
      .url
      .parse()
      .map_err(|e| Error::invalid_request(format!("stored url {}: {}", record.url, e)))?;
    let scheme = stored.scheme_str().unwrap_or("https");
    let authority = stored
      .authority()
      .map(|a| a.as_str().to_string())
      .or_else(|| record.headers.get(HOST.as_str()).cloned())
      .ok_or_else(|| Error::invalid_request(format!("no host for {}", document.request_id)))?;

    let mut target = format!("{}{}", record.path, self.path_payload);
    if let Some(query) = stored.query() {
      target.push('?');
      target.push_str(query);
    }
    let uri: Uri = format!("{}://{}{}", scheme, authority, target).parse()?;

    let mut builder = Request::builder().method(record.method.clone()).uri(uri);
    for (name, value) in &record.headers {
      let name = HeaderName::from_bytes(name.as_bytes())?;
      if name == PROXY_CONNECTION
        || name == CONNECTION
        || name == CONTENT_LENGTH
        || name == TRANSFER_ENCODING
        || name == COOKIE
      {
        continue;
      }
      let value = if name == HOST {
        HeaderValue::from_str(value)?
      } else {
        HeaderValue::from_str(&format!("{}{}", value, self.value_payload))?
      };
      builder = builder.header(name, value);
    }
    builder = builder.header(CONNECTION, HeaderValue::from_static("keep-alive"));

    if !record.cookies.is_empty() {
      let cookies = record
        .cookies
        .iter()
        .map(|(name, value)| {
          cookie::Cookie::new(name.as_str(), format!("{}{}", value, self.value_payload)).to_string()
        })
        .collect::<Vec<_>>()
        .join("; ");
      builder = builder.header(COOKIE, HeaderValue::from_str(&cookies)?);
    }

    Ok(builder.body(record.body_bytes()?)?)
  }

  /// Load `request_id`, inject and send it, returning the origin's response.
  pub async fn inject(&self, request_id: &str) -> Result<Response<Bytes>> {
    let document = self
      .store
      .get_by_request_id(request_id)
      .await?
      .ok_or_else(|| Error::NotFound(request_id.to_string()))?;
    let request = self.prepare(&document)?;
    tracing::info!("[INJECT] {} {}", request.method(), request.uri());
    self.client.execute(request).await
  }
}
