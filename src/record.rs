//! Captured request/response records
//!
//! Records are what the [`Store`](crate::store::Store) keeps and what the
//! [`Injector`](crate::injector::Injector) replays. Header maps keep the last
//! non-empty value per name; bodies that are not UTF-8 are kept as base64.
use crate::codec::ReasonPhrase;
use crate::errors::{Error, Result};
use base64::Engine;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, COOKIE, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a record body is stored
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  /// standard base64
  Base64,
}

/// A request as seen by the proxy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// unix seconds
  pub timestamp: i64,
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// absolute url
  pub url: String,
  pub path: String,
  /// decoded query parameters
  pub query: BTreeMap<String, String>,
  pub headers: BTreeMap<String, String>,
  pub cookies: BTreeMap<String, String>,
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body_encoding: Option<BodyEncoding>,
}

/// A response as seen by the proxy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// unix seconds
  pub timestamp: i64,
  #[serde(with = "http_serde::status_code")]
  pub status_code: StatusCode,
  /// status line text, e.g. `200 OK`
  pub message: String,
  pub headers: BTreeMap<String, String>,
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body_encoding: Option<BodyEncoding>,
}

/// One stored exchange
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub request_id: String,
  pub request: RequestRecord,
  #[serde(default)]
  pub response: Option<ResponseRecord>,
}

fn now() -> i64 {
  time::OffsetDateTime::now_utc().unix_timestamp()
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut map = BTreeMap::new();
  for (k, v) in headers.iter() {
    let value = String::from_utf8_lossy(v.as_bytes()).to_string();
    if !value.is_empty() {
      map.insert(k.as_str().to_string(), value);
    }
  }
  map
}

fn decode_component(raw: &str) -> String {
  percent_decode_str(&raw.replace('+', " "))
    .decode_utf8_lossy()
    .to_string()
}

fn query_map(query: Option<&str>) -> BTreeMap<String, String> {
  query
    .unwrap_or_default()
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| {
      let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
      (decode_component(k), decode_component(v))
    })
    .collect()
}

fn cookie_map(headers: &HeaderMap) -> BTreeMap<String, String> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(cookie::Cookie::split_parse)
    .filter_map(|c| c.ok())
    .map(|c| (c.name().to_string(), c.value().to_string()))
    .collect()
}

#[cfg(feature = "gzip")]
fn inflate(headers: &HeaderMap, body: &[u8]) -> Option<Vec<u8>> {
  use std::io::Read;
  let gzip = headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
  if !gzip || body.is_empty() {
    return None;
  }
  let mut out = Vec::new();
  match flate2::read::GzDecoder::new(body).read_to_end(&mut out) {
    Ok(_) => Some(out),
    Err(e) => {
      tracing::debug!("[RECORD] keeping gzip body as is: {}", e);
      None
    }
  }
}

#[cfg(not(feature = "gzip"))]
fn inflate(_headers: &HeaderMap, _body: &[u8]) -> Option<Vec<u8>> {
  None
}

fn encode_body(body: &[u8]) -> (String, Option<BodyEncoding>) {
  match std::str::from_utf8(body) {
    Ok(s) => (s.to_string(), None),
    Err(_) => (
      base64::engine::general_purpose::STANDARD.encode(body),
      Some(BodyEncoding::Base64),
    ),
  }
}

fn decode_body(body: &str, encoding: Option<BodyEncoding>) -> Result<Bytes> {
  match encoding {
    None => Ok(Bytes::from(body.to_string())),
    Some(BodyEncoding::Base64) => base64::engine::general_purpose::STANDARD
      .decode(body)
      .map(Bytes::from)
      .map_err(|e| Error::store(format!("corrupt base64 body: {}", e))),
  }
}

impl RequestRecord {
  /// Record `request`. Origin-form targets are made absolute with `scheme`
  /// and the `Host` header, or `authority` when the header is missing.
  pub fn capture<B: AsRef<[u8]>>(request: &Request<B>, scheme: &str, authority: Option<&str>) -> Self {
    let uri = request.uri();
    let url = if uri.scheme().is_some() {
      uri.to_string()
    } else {
      let host = request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or(authority)
        .unwrap_or_default();
      let target = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
      format!("{}://{}{}", scheme, host, target)
    };
    let (body, body_encoding) = encode_body(request.body().as_ref());
    RequestRecord {
      timestamp: now(),
      method: request.method().clone(),
      url,
      path: uri.path().to_string(),
      query: query_map(uri.query()),
      headers: header_map(request.headers()),
      cookies: cookie_map(request.headers()),
      body,
      body_encoding,
    }
  }

  /// Raw body bytes
  pub fn body_bytes(&self) -> Result<Bytes> {
    decode_body(&self.body, self.body_encoding)
  }
}

impl ResponseRecord {
  /// Record `response`, inflating gzip bodies when supported.
  pub fn capture<B: AsRef<[u8]>>(response: &Response<B>) -> Self {
    let status = response.status();
    let reason = response
      .extensions()
      .get::<ReasonPhrase>()
      .map(|r| r.0.clone())
      .filter(|r| !r.is_empty())
      .or_else(|| status.canonical_reason().map(str::to_string));
    let message = match reason {
      Some(reason) => format!("{} {}", status.as_str(), reason),
      None => status.as_str().to_string(),
    };
    let raw = response.body().as_ref();
    let inflated = inflate(response.headers(), raw);
    let (body, body_encoding) = encode_body(inflated.as_deref().unwrap_or(raw));
    ResponseRecord {
      timestamp: now(),
      status_code: status,
      message,
      headers: header_map(response.headers()),
      body,
      body_encoding,
    }
  }

  /// Raw body bytes, after any inflation done at capture time
  pub fn body_bytes(&self) -> Result<Bytes> {
    decode_body(&self.body, self.body_encoding)
  }
}
