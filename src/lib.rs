#![cfg_attr(docsrs, feature(doc_cfg))]

//! # trebuchet (投石机)
//!
//! An intercepting HTTP/HTTPS proxy for application security testing.
//!
//! - Plain HTTP requests are relayed to their origin with a [`ForwardingClient`]
//!   that never follows redirects.
//! - `CONNECT` requests are intercepted: the client's TLS session is terminated
//!   with a leaf certificate minted by a [`CertificateAuthority`], a second TLS
//!   session is opened to the origin, and bytes are copied both ways.
//! - Exchanges can be captured into a [`Store`] and replayed later with an
//!   injected payload by the [`Injector`].
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> trebuchet::Result<()> {
//! use std::sync::Arc;
//!
//! let authority = trebuchet::CertificateAuthority::bootstrap("certs").await?;
//! let server = trebuchet::ProxyServer::builder()
//!   .authority(Arc::new(authority))
//!   .store(Arc::new(trebuchet::MemoryStore::default()))
//!   .injector(true)
//!   .bind("127.0.0.1:8080")
//!   .await?;
//! server.run_until(async {
//!   tokio::signal::ctrl_c().await.ok();
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Clients must trust `certs/ca.crt` for interception to go unnoticed.
//!
//! ## Optional Features
//!
//! - **gzip**: inflate gzip response bodies before they are stored.
//!
mod ca;
mod capture;
mod client;
/// HTTP/1.1 message reading and writing
pub mod codec;
/// YAML configuration
pub mod config;
mod connector;
mod errors;
mod injector;
/// tracing subscriber bootstrap
pub mod logger;
/// captured exchange records
pub mod record;
mod relay;
mod server;
mod socket;
mod store;
/// rustls configuration
pub mod tls;
mod tunnel;

pub use ca::{CertificateAuthority, LeafCache, LeafCertificate, LeafIssuer, CA_CERT_FILE, CA_KEY_FILE, LEAF_VALIDITY};
pub use capture::CaptureReport;
pub use client::{ClientBuilder, ForwardingClient};
pub use config::Config;
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::{Method, StatusCode, Uri};
pub use injector::{Injector, DEFAULT_PATH_PAYLOAD, DEFAULT_VALUE_PAYLOAD};
pub use record::{Document, RequestRecord, ResponseRecord};
pub use relay::{strip_hop_headers, Relay, PROXY_CONNECTION};
pub use server::{ProxyServer, ProxyServerBuilder, SessionRegistry};
pub use socket::{Hijacked, MaybeTlsStream, Socket};
pub use store::{FileStore, IdGenerator, MemoryStore, RandomIdGenerator, Store, REQUEST_ID_LEN};
pub use tokio_rustls::rustls;
pub use tunnel::{connect_target, Tunnel, TunnelHandle, TunnelOptions, TunnelOutcome, CONNECT_ESTABLISHED};
