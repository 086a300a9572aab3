//! Storage of captured exchanges
//!
//! Proxying never waits on the store succeeding: callers log failures and
//! carry on. Implementations must tolerate concurrent, unordered writes.
use crate::errors::{Error, Result};
use crate::record::{Document, RequestRecord, ResponseRecord};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Length of generated request identifiers
pub const REQUEST_ID_LEN: usize = 64;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Sink and source for captured exchanges
#[async_trait]
pub trait Store: Send + Sync {
  /// Persist a request and return its generated identifier
  async fn write_request(&self, request: RequestRecord) -> Result<String>;
  /// Attach the response to a previously written request
  async fn write_response(&self, response: ResponseRecord, request_id: &str) -> Result<()>;
  /// Load a document, `Ok(None)` when the id is unknown
  async fn get_by_request_id(&self, request_id: &str) -> Result<Option<Document>>;
}

/// Write a request and then its response, returning the request id.
pub async fn record_exchange(
  store: &dyn Store,
  request: RequestRecord,
  response: Option<ResponseRecord>,
) -> Result<String> {
  let id = store.write_request(request).await?;
  if let Some(response) = response {
    store.write_response(response, &id).await?;
  }
  Ok(id)
}

/// Source of request identifiers
pub trait IdGenerator: Send + Sync {
  /// A fresh identifier
  fn next_id(&self) -> String;
}

/// Random alphanumeric identifiers
#[derive(Debug)]
pub struct RandomIdGenerator {
  rng: Mutex<StdRng>,
  len: usize,
}

impl Default for RandomIdGenerator {
  fn default() -> Self {
    Self {
      rng: Mutex::new(StdRng::from_entropy()),
      len: REQUEST_ID_LEN,
    }
  }
}

impl RandomIdGenerator {
  /// Deterministic sequence for tests and reproducible runs
  pub fn with_seed(seed: u64) -> Self {
    Self {
      rng: Mutex::new(StdRng::seed_from_u64(seed)),
      len: REQUEST_ID_LEN,
    }
  }
}

impl IdGenerator for RandomIdGenerator {
  fn next_id(&self) -> String {
    let mut rng = match self.rng.lock() {
      Ok(rng) => rng,
      Err(poisoned) => poisoned.into_inner(),
    };
    (0..self.len)
      .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
      .collect()
  }
}

fn valid_id(id: &str) -> bool {
  !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// In-process store
pub struct MemoryStore {
  documents: RwLock<HashMap<String, Document>>,
  ids: Arc<dyn IdGenerator>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new(Arc::new(RandomIdGenerator::default()))
  }
}

impl MemoryStore {
  pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      documents: RwLock::new(HashMap::new()),
      ids,
    }
  }

  /// Number of stored documents
  pub async fn len(&self) -> usize {
    self.documents.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.documents.read().await.is_empty()
  }

  /// Every stored document, oldest request first
  pub async fn documents(&self) -> Vec<Document> {
    let mut docs: Vec<Document> = self.documents.read().await.values().cloned().collect();
    docs.sort_by_key(|d| d.request.timestamp);
    docs
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn write_request(&self, request: RequestRecord) -> Result<String> {
    let request_id = self.ids.next_id();
    let document = Document {
      request_id: request_id.clone(),
      request,
      response: None,
    };
    self.documents.write().await.insert(request_id.clone(), document);
    Ok(request_id)
  }

  async fn write_response(&self, response: ResponseRecord, request_id: &str) -> Result<()> {
    match self.documents.write().await.get_mut(request_id) {
      Some(document) => {
        document.response = Some(response);
        Ok(())
      }
      None => Err(Error::NotFound(request_id.to_string())),
    }
  }

  async fn get_by_request_id(&self, request_id: &str) -> Result<Option<Document>> {
    Ok(self.documents.read().await.get(request_id).cloned())
  }
}

/// One JSON file per document, named `<request_id>.json`
pub struct FileStore {
  dir: PathBuf,
  ids: Arc<dyn IdGenerator>,
}

impl FileStore {
  /// Store documents under `dir`, creating it on first write
  pub fn new(dir: impl Into<PathBuf>, ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      dir: dir.into(),
      ids,
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn path_for(&self, request_id: &str) -> PathBuf {
    self.dir.join(format!("{}.json", request_id))
  }

  async fn save(&self, document: &Document) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| Error::store(format!("cannot create {}: {}", self.dir.display(), e)))?;
    let path = self.path_for(&document.request_id);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(&tmp, data)
      .await
      .map_err(|e| Error::store(format!("cannot write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, &path)
      .await
      .map_err(|e| Error::store(format!("cannot write {}: {}", path.display(), e)))
  }
}

#[async_trait]
impl Store for FileStore {
  async fn write_request(&self, request: RequestRecord) -> Result<String> {
    let request_id = self.ids.next_id();
    let document = Document {
      request_id: request_id.clone(),
      request,
      response: None,
    };
    self.save(&document).await?;
    Ok(request_id)
  }

  async fn write_response(&self, response: ResponseRecord, request_id: &str) -> Result<()> {
    let mut document = self
      .get_by_request_id(request_id)
      .await?
      .ok_or_else(|| Error::NotFound(request_id.to_string()))?;
    document.response = Some(response);
    self.save(&document).await
  }

  async fn get_by_request_id(&self, request_id: &str) -> Result<Option<Document>> {
    if !valid_id(request_id) {
      return Ok(None);
    }
    let path = self.path_for(request_id);
    match tokio::fs::read(&path).await {
      Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(Error::store(format!("cannot read {}: {}", path.display(), e))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use http::{Request, Response};

  fn sample() -> (RequestRecord, ResponseRecord) {
    let request = Request::builder()
      .uri("http://example.test/a?b=c")
      .body(Bytes::from_static(b"req"))
      .unwrap();
    let response = Response::new(Bytes::from_static(b"resp"));
    (
      RequestRecord::capture(&request, "http", None),
      ResponseRecord::capture(&response),
    )
  }

  #[test]
  fn generated_ids_are_alphanumeric_and_seedable() {
    let a = RandomIdGenerator::with_seed(7);
    let b = RandomIdGenerator::with_seed(7);
    let id = a.next_id();
    assert_eq!(id.len(), REQUEST_ID_LEN);
    assert!(valid_id(&id));
    assert_eq!(id, b.next_id());
    assert_ne!(a.next_id(), id);
  }

  #[tokio::test]
  async fn memory_store_pairs_request_and_response() {
    let store = MemoryStore::default();
    let (request, response) = sample();
    let id = record_exchange(&store, request.clone(), Some(response.clone()))
      .await
      .unwrap();
    let document = store.get_by_request_id(&id).await.unwrap().unwrap();
    assert_eq!(document.request, request);
    assert_eq!(document.response, Some(response.clone()));
    assert!(store.get_by_request_id("missing").await.unwrap().is_none());
    assert!(matches!(
      store.write_response(response, "missing").await,
      Err(Error::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn file_store_round_trips_documents() {
    let dir = std::env::temp_dir().join(format!("trebuchet-store-{}", std::process::id()));
    let store = FileStore::new(&dir, Arc::new(RandomIdGenerator::with_seed(1)));
    let (request, response) = sample();
    let id = store.write_request(request.clone()).await.unwrap();
    assert!(dir.join(format!("{}.json", id)).exists());
    let pending = store.get_by_request_id(&id).await.unwrap().unwrap();
    assert!(pending.response.is_none());

    store.write_response(response.clone(), &id).await.unwrap();
    let document = store.get_by_request_id(&id).await.unwrap().unwrap();
    assert_eq!(document.request, request);
    assert_eq!(document.response, Some(response));
    assert!(store.get_by_request_id("../etc/passwd").await.unwrap().is_none());
    std::fs::remove_dir_all(&dir).ok();
  }
}
