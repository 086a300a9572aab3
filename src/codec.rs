//! HTTP/1.x message framing
//!
//! Heads are parsed line by line from any buffered reader, bodies are read
//! according to RFC 9112 framing and handed back fully de-chunked. The same
//! reader functions serve the listener, the forwarding client and the tunnel
//! capture.
use crate::errors::{Error, Result};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a request or response head
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const CR_LF: &[u8] = &[13, 10];
const SPACE: &[u8] = &[32];
const COLON_SPACE: &[u8] = &[58, 32];

/// Reason phrase sent by the origin, kept in the response extensions so it
/// survives the round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// How the body of a message is delimited on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
  /// No body
  Empty,
  /// Exactly this many bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Everything until the peer closes
  UntilClose,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Side {
  Request,
  Response,
}

impl Side {
  fn error(self, msg: impl Into<String>) -> Error {
    match self {
      Side::Request => Error::invalid_request(msg),
      Side::Response => Error::invalid_response(msg),
    }
  }
}

async fn read_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  line: &mut Vec<u8>,
  budget: &mut usize,
  side: Side,
) -> Result<usize> {
  line.clear();
  let mut limited = (&mut *reader).take(*budget as u64);
  let n = limited.read_until(b'\n', line).await?;
  if n > 0 && !line.ends_with(b"\n") {
    if n >= *budget {
      return Err(side.error(format!("head exceeds {} bytes", MAX_HEAD_BYTES)));
    }
    return Err(side.error("truncated head"));
  }
  *budget -= n;
  Ok(n)
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(raw: &[u8], side: Side) -> Result<Version> {
  match raw {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(side.error(format!(
      "unsupported version {}",
      String::from_utf8_lossy(raw)
    ))),
  }
}

pub(crate) fn parser_headers(buffer: &[u8], side: Side) -> Result<(HeaderName, HeaderValue)> {
  if buffer.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
    return Err(side.error("obsolete header line folding"));
  }
  let mut parts = buffer.splitn(2, |b| *b == b':');
  let name = parts.next().unwrap_or_default();
  let value = parts
    .next()
    .ok_or_else(|| side.error(format!("malformed header {}", String::from_utf8_lossy(buffer))))?;
  let name = HeaderName::from_bytes(name).map_err(|e| side.error(e.to_string()))?;
  let value = HeaderValue::from_bytes(value.trim_ascii()).map_err(|e| side.error(e.to_string()))?;
  Ok((name, value))
}

async fn read_headers<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  budget: &mut usize,
  side: Side,
) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    if read_line(reader, &mut line, budget, side).await? == 0 {
      return Err(side.error("truncated head"));
    }
    let header = trim_line(&line);
    if header.is_empty() {
      return Ok(headers);
    }
    let (k, v) = parser_headers(header, side)?;
    headers.append(k, v);
  }
}

/// Read a request head. `Ok(None)` means the peer closed before sending anything.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<http::request::Parts>> {
  let side = Side::Request;
  let mut budget = MAX_HEAD_BYTES;
  let mut line = Vec::new();
  // tolerate stray CRLF between pipelined messages
  loop {
    if read_line(reader, &mut line, &mut budget, side).await? == 0 {
      return Ok(None);
    }
    if !trim_line(&line).is_empty() {
      break;
    }
  }
  let request_line = trim_line(&line).to_vec();
  let mut pieces = request_line.split(|b| *b == b' ');
  let (Some(method), Some(target), Some(version), None) =
    (pieces.next(), pieces.next(), pieces.next(), pieces.next())
  else {
    return Err(side.error(format!(
      "malformed request line {}",
      String::from_utf8_lossy(&request_line)
    )));
  };
  let method = Method::from_bytes(method).map_err(|e| side.error(e.to_string()))?;
  let uri = Uri::try_from(target).map_err(|e| side.error(e.to_string()))?;
  let version = parse_version(version, side)?;
  let headers = read_headers(reader, &mut budget, side).await?;

  let (mut parts, _) = Request::builder()
    .method(method)
    .uri(uri)
    .version(version)
    .body(())?
    .into_parts();
  parts.headers = headers;
  Ok(Some(parts))
}

/// Read a response head, status line included.
pub async fn read_response_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<http::response::Parts> {
  let side = Side::Response;
  let mut budget = MAX_HEAD_BYTES;
  let mut line = Vec::new();
  if read_line(reader, &mut line, &mut budget, side).await? == 0 {
    return Err(side.error("connection closed before response"));
  }
  let status_line = trim_line(&line).to_vec();
  let mut pieces = status_line.splitn(3, |b| *b == b' ');
  let version = parse_version(pieces.next().unwrap_or_default(), side)?;
  let status = pieces
    .next()
    .filter(|s| s.len() == 3)
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| side.error(format!("malformed status line {}", String::from_utf8_lossy(&status_line))))?;
  let reason = String::from_utf8_lossy(pieces.next().unwrap_or_default()).to_string();
  let headers = read_headers(reader, &mut budget, side).await?;

  let (mut parts, _) = Response::builder()
    .status(status)
    .version(version)
    .body(())?
    .into_parts();
  parts.headers = headers;
  parts.extensions.insert(ReasonPhrase(reason));
  Ok(parts)
}

fn is_chunked(headers: &HeaderMap) -> Option<bool> {
  let last = headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|v| v.trim().to_ascii_lowercase())
    .filter(|v| !v.is_empty())
    .last()?;
  Some(last == "chunked")
}

fn content_length(headers: &HeaderMap, side: Side) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(CONTENT_LENGTH) {
    for item in value.to_str().unwrap_or_default().split(',') {
      let parsed: u64 = item
        .trim()
        .parse()
        .map_err(|_| side.error(format!("invalid content-length {:?}", value)))?;
      if length.is_some_and(|l| l != parsed) {
        return Err(side.error("conflicting content-length values"));
      }
      length = Some(parsed);
    }
  }
  Ok(length)
}

/// Body framing of a request
pub fn request_framing(parts: &http::request::Parts) -> Result<Framing> {
  if parts.method == Method::CONNECT {
    return Ok(Framing::Empty);
  }
  match is_chunked(&parts.headers) {
    Some(true) => return Ok(Framing::Chunked),
    Some(false) => return Err(Error::invalid_request("unsupported transfer-encoding")),
    None => {}
  }
  Ok(match content_length(&parts.headers, Side::Request)? {
    None | Some(0) => Framing::Empty,
    Some(n) => Framing::Length(n),
  })
}

/// Body framing of a response to a request made with `method`
pub fn response_framing(method: &Method, parts: &http::response::Parts) -> Result<Framing> {
  let status = parts.status;
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || (method == Method::CONNECT && status.is_success())
  {
    return Ok(Framing::Empty);
  }
  match is_chunked(&parts.headers) {
    Some(true) => return Ok(Framing::Chunked),
    Some(false) => return Ok(Framing::UntilClose),
    None => {}
  }
  Ok(match content_length(&parts.headers, Side::Response)? {
    Some(0) => Framing::Empty,
    Some(n) => Framing::Length(n),
    None => Framing::UntilClose,
  })
}

fn check_limit(len: u64, limit: Option<usize>, side: Side) -> Result<()> {
  match limit {
    Some(max) if len > max as u64 => Err(side.error(format!("body exceeds {} bytes", max))),
    _ => Ok(()),
  }
}

pub(crate) async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  framing: Framing,
  limit: Option<usize>,
  side: Side,
) -> Result<Bytes> {
  match framing {
    Framing::Empty => Ok(Bytes::new()),
    Framing::Length(n) => {
      check_limit(n, limit, side)?;
      let mut body = Vec::with_capacity(n.min(1 << 20) as usize);
      let read = (&mut *reader).take(n).read_to_end(&mut body).await?;
      if (read as u64) < n {
        return Err(side.error(format!("body truncated after {} of {} bytes", read, n)));
      }
      Ok(Bytes::from(body))
    }
    Framing::UntilClose => {
      let mut body = Vec::new();
      let cap = limit.map(|l| l as u64 + 1).unwrap_or(u64::MAX);
      (&mut *reader).take(cap).read_to_end(&mut body).await?;
      check_limit(body.len() as u64, limit, side)?;
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader, limit, side).await,
  }
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  limit: Option<usize>,
  side: Side,
) -> Result<Bytes> {
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  let mut budget = MAX_HEAD_BYTES;
  loop {
    if read_line(reader, &mut line, &mut budget, side).await? == 0 {
      return Err(side.error("truncated chunked body"));
    }
    budget = MAX_HEAD_BYTES;
    let size_line = trim_line(&line);
    let size = size_line
      .split(|b| *b == b';')
      .next()
      .map(|s| String::from_utf8_lossy(s).trim().to_string())
      .and_then(|s| u64::from_str_radix(&s, 16).ok())
      .ok_or_else(|| side.error(format!("invalid chunk size {}", String::from_utf8_lossy(size_line))))?;
    if size == 0 {
      break;
    }
    check_limit(body.len() as u64 + size, limit, side)?;
    let start = body.len();
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) < size {
      body.truncate(start);
      return Err(side.error("truncated chunk"));
    }
    if read_line(reader, &mut line, &mut budget, side).await? == 0 || !trim_line(&line).is_empty() {
      return Err(side.error("missing CRLF after chunk"));
    }
  }
  // trailers are read and dropped
  loop {
    if read_line(reader, &mut line, &mut budget, side).await? == 0 || trim_line(&line).is_empty() {
      break;
    }
  }
  Ok(Bytes::from(body))
}

/// Read a complete request, body de-chunked. `Ok(None)` on a clean close.
pub async fn read_request<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  limit: Option<usize>,
) -> Result<Option<Request<Bytes>>> {
  let Some(parts) = read_request_head(reader).await? else {
    return Ok(None);
  };
  let framing = request_framing(&parts)?;
  let body = read_body(reader, framing, limit, Side::Request).await?;
  Ok(Some(Request::from_parts(parts, body)))
}

/// Read a complete response to a request made with `method`, body de-chunked.
pub async fn read_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  method: &Method,
  limit: Option<usize>,
) -> Result<(Response<Bytes>, Framing)> {
  let parts = read_response_head(reader).await?;
  let framing = response_framing(method, &parts)?;
  let body = read_body(reader, framing, limit, Side::Response).await?;
  Ok((Response::from_parts(parts, body), framing))
}

/// Replace chunked or close-delimited framing with an explicit `Content-Length`.
pub fn set_content_length(headers: &mut HeaderMap, len: usize) {
  headers.remove(TRANSFER_ENCODING);
  headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

fn extend_headers(raw: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
}

/// Serialize a request in origin-form, adding `Host` from the URI when absent.
///
/// The body is complete by now, so it always goes out with a `Content-Length`
/// and any `Transfer-Encoding` of the incoming message is dropped.
pub fn request_to_raw<B: AsRef<[u8]>>(request: &Request<B>) -> Bytes {
  let mut raw = Vec::new();
  raw.extend(request.method().as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(
    request
      .uri()
      .path_and_query()
      .map(|p| p.as_str())
      .filter(|p| !p.is_empty())
      .unwrap_or("/")
      .as_bytes(),
  );
  raw.extend(SPACE);
  raw.extend(format!("{:?}", request.version()).as_bytes());
  raw.extend(CR_LF);
  if request.headers().get(HOST).is_none() {
    if let Some(authority) = request.uri().authority() {
      raw.extend(HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(authority.as_str().as_bytes());
      raw.extend(CR_LF);
    }
  }
  let body = request.body().as_ref();
  let mut headers = request.headers().clone();
  if !body.is_empty() || headers.contains_key(TRANSFER_ENCODING) {
    set_content_length(&mut headers, body.len());
  }
  extend_headers(&mut raw, &headers);
  raw.extend(CR_LF);
  raw.extend(body);
  Bytes::from(raw)
}

/// Serialize a response, keeping the origin's reason phrase when known.
pub fn response_to_raw<B: AsRef<[u8]>>(response: &Response<B>) -> Bytes {
  let mut raw = Vec::new();
  raw.extend(format!("{:?}", response.version()).as_bytes());
  raw.extend(SPACE);
  raw.extend(response.status().as_str().as_bytes());
  raw.extend(SPACE);
  let reason = response
    .extensions()
    .get::<ReasonPhrase>()
    .map(|r| r.0.as_str())
    .or_else(|| response.status().canonical_reason())
    .unwrap_or_default();
  raw.extend(reason.as_bytes());
  raw.extend(CR_LF);
  extend_headers(&mut raw, response.headers());
  raw.extend(CR_LF);
  raw.extend(response.body().as_ref());
  Bytes::from(raw)
}

/// A complete response carrying `body` as plain text
pub fn simple_response(status: StatusCode, body: &str) -> Response<Bytes> {
  let mut response = Response::new(Bytes::from(body.to_string()));
  *response.status_mut() = status;
  let headers = response.headers_mut();
  headers.insert(
    http::header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  response
}
