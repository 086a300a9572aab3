//! Tunnel capture
//!
//! Both copy directions of a tunnel feed a [`Tee`] with every chunk they
//! forward. Each tee drives a decoder task that parses the cleartext with the
//! regular [`codec`](crate::codec) readers; requests are handed to the
//! response side in order, which pairs them with their responses and writes
//! the exchange to the store. Capture never applies backpressure to the relay:
//! once a decoder stops, its tee silently drops further bytes.
use crate::codec;
use crate::errors::Error;
use crate::record::{RequestRecord, ResponseRecord};
use crate::store::{record_exchange, Store};
use bytes::{Buf, Bytes};
use http::{Method, StatusCode};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What capture achieved on one tunnel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureReport {
  /// exchanges handed to the store
  pub recorded: usize,
  /// store writes that failed
  pub store_failures: usize,
  /// first reason capture stopped early
  pub failure: Option<String>,
}

/// Copy of one direction's bytes
#[derive(Debug, Default)]
pub struct Tee {
  tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Tee {
  /// A tee that discards everything
  pub fn disabled() -> Self {
    Self { tx: None }
  }

  /// Whether a decoder is still listening
  pub fn is_active(&self) -> bool {
    self.tx.is_some()
  }

  /// Hand `bytes` to the decoder
  pub fn feed(&mut self, bytes: &[u8]) {
    if let Some(tx) = &self.tx {
      if tx.send(Bytes::copy_from_slice(bytes)).is_err() {
        self.tx = None;
      }
    }
  }
}

struct ChannelReader {
  rx: mpsc::UnboundedReceiver<Bytes>,
  pending: Bytes,
}

impl ChannelReader {
  fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
    Self {
      rx,
      pending: Bytes::new(),
    }
  }
}

impl AsyncRead for ChannelReader {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    while !this.pending.has_remaining() {
      match this.rx.poll_recv(cx) {
        Poll::Ready(Some(bytes)) => this.pending = bytes,
        // closed channel reads as EOF
        Poll::Ready(None) => return Poll::Ready(Ok(())),
        Poll::Pending => return Poll::Pending,
      }
    }
    let n = this.pending.len().min(buf.remaining());
    buf.put_slice(&this.pending.split_to(n));
    Poll::Ready(Ok(()))
  }
}

/// Start capturing a tunnel to `authority`.
///
/// Returns the tee for client bytes, the tee for origin bytes, and a handle
/// resolving to the report once both directions have ended.
pub fn spawn(
  store: Arc<dyn Store>,
  authority: String,
  max_body: Option<usize>,
) -> (Tee, Tee, JoinHandle<CaptureReport>) {
  let (client_tx, client_rx) = mpsc::unbounded_channel();
  let (origin_tx, origin_rx) = mpsc::unbounded_channel();
  let (pending_tx, pending_rx) = mpsc::unbounded_channel();

  let handle = tokio::spawn(async move {
    let requests = decode_requests(ChannelReader::new(client_rx), authority, max_body, pending_tx);
    let responses = decode_responses(ChannelReader::new(origin_rx), store, max_body, pending_rx);
    let (request_failure, (mut report, upgraded)) = tokio::join!(requests, responses);
    if report.failure.is_none() && !upgraded {
      report.failure = request_failure;
    }
    if let Some(failure) = &report.failure {
      tracing::debug!("[CAPTURE] stopped: {}", failure);
    }
    report
  });

  (
    Tee { tx: Some(client_tx) },
    Tee { tx: Some(origin_tx) },
    handle,
  )
}

async fn decode_requests(
  reader: ChannelReader,
  authority: String,
  max_body: Option<usize>,
  pending: mpsc::UnboundedSender<(Method, RequestRecord)>,
) -> Option<String> {
  let mut reader = BufReader::new(reader);
  loop {
    match codec::read_request(&mut reader, max_body).await {
      Ok(Some(request)) => {
        let record = RequestRecord::capture(&request, "https", Some(&authority));
        if pending.send((request.method().clone(), record)).is_err() {
          return None;
        }
      }
      Ok(None) => return None,
      Err(e) => return Some(format!("request decoding failed: {}", e)),
    }
  }
}

async fn decode_responses(
  reader: ChannelReader,
  store: Arc<dyn Store>,
  max_body: Option<usize>,
  mut pending: mpsc::UnboundedReceiver<(Method, RequestRecord)>,
) -> (CaptureReport, bool) {
  let mut reader = BufReader::new(reader);
  let mut report = CaptureReport::default();
  while let Some((method, request)) = pending.recv().await {
    let response = loop {
      match reader.fill_buf().await {
        Ok([]) => break Ok(None),
        Ok(_) => {}
        Err(e) => break Err(Error::from(e)),
      }
      match codec::read_response(&mut reader, &method, max_body).await {
        Ok((response, _)) if response.status().is_informational()
          && response.status() != StatusCode::SWITCHING_PROTOCOLS => {}
        Ok((response, _)) => break Ok(Some(response)),
        Err(e) => break Err(e),
      }
    };
    match response {
      Ok(response) => {
        let upgraded = response
          .as_ref()
          .is_some_and(|r| r.status() == StatusCode::SWITCHING_PROTOCOLS);
        let closed = response.is_none();
        let response = response.as_ref().map(ResponseRecord::capture);
        match record_exchange(store.as_ref(), request, response).await {
          Ok(id) => {
            report.recorded += 1;
            tracing::debug!("[CAPTURE] recorded {}", id);
          }
          Err(e) => {
            report.store_failures += 1;
            tracing::warn!("[CAPTURE] store write failed: {}", e);
          }
        }
        if upgraded {
          return (report, true);
        }
        if closed {
          break;
        }
      }
      Err(e) => {
        report.failure = Some(format!("response decoding failed: {}", e));
        // the request is still worth keeping
        if let Err(e) = record_exchange(store.as_ref(), request, None).await {
          report.store_failures += 1;
          tracing::warn!("[CAPTURE] store write failed: {}", e);
        } else {
          report.recorded += 1;
        }
        break;
      }
    }
  }
  (report, false)
}
