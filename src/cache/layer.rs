//! Cache layer that runs the caching strategies around a network fetch.

use chrono::{DateTime, Duration, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::clock::Clock;
use crate::http::{CachedResponse, Response};

/// Cache layer bound to one namespace of a storage backend.
///
/// Every cache read or write failure is logged and treated as a miss or a
/// skipped write; only the fetcher's own error ever reaches the caller.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  namespace: String,
  /// Oldest entry a network-first fallback may serve (None = any age)
  fallback_max_age: Option<Duration>,
  /// Background writes not yet known to be finished
  writes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      clock,
      namespace: namespace.into(),
      fallback_max_age: None,
      writes: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Refuse to serve fallback entries older than `max_age`.
  pub fn with_fallback_max_age(mut self, max_age: Option<Duration>) -> Self {
    self.fallback_max_age = max_age;
    self
  }

  /// Network-first: live response when possible, cached copy when the network fails.
  ///
  /// A cacheable response is copied and written in a background task the
  /// caller never waits on.
  pub async fn network_first<F, Fut, E>(&self, key: &str, fetcher: F) -> Result<CacheResult<Response>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, E>>,
    E: Display,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_cacheable() {
          // Copy taken before the response is handed back
          let cached = CachedResponse::from_response(&response);
          self.store_in_background(key.to_string(), cached);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match self.lookup(key).await {
        Some((response, cached_at)) if self.fallback_allowed(cached_at) => {
          debug!(key, error = %err, "Network failed, serving cached response");
          Ok(CacheResult::offline(response, cached_at))
        }
        Some((_, cached_at)) => {
          debug!(key, %cached_at, "Cached response too old for fallback");
          Err(err)
        }
        None => Err(err),
      },
    }
  }

  /// Cache-first: a hit never touches the network, a miss fetches and stores.
  pub async fn cache_first<F, Fut, E>(&self, key: &str, fetcher: F) -> Result<CacheResult<Response>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, E>>,
  {
    if let Some((response, cached_at)) = self.lookup(key).await {
      return Ok(CacheResult::from_cache(response, cached_at));
    }

    let response = fetcher().await?;
    if response.is_cacheable() {
      self.store(key, CachedResponse::from_response(&response)).await;
    }
    Ok(CacheResult::from_network(response))
  }

  /// Read a cached response on the blocking pool. Errors and corrupt
  /// entries count as misses.
  pub async fn lookup(&self, key: &str) -> Option<(Response, DateTime<Utc>)> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.namespace.clone();
    let owned_key = key.to_string();
    let read = tokio::task::spawn_blocking(move || {
      storage.get_json::<CachedResponse>(&namespace, &owned_key)
    })
    .await;

    let read = match read {
      Ok(read) => read,
      Err(e) => {
        warn!(namespace = %self.namespace, key, error = %e, "Cache read task failed");
        return None;
      }
    };

    match read {
      Ok(Some((cached, cached_at))) => {
        if cached.verify() {
          Some((cached.into_response(), cached_at))
        } else {
          warn!(namespace = %self.namespace, key, "Cached body does not match digest, ignoring");
          None
        }
      }
      Ok(None) => None,
      Err(e) => {
        warn!(namespace = %self.namespace, key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Write a response and wait for it, logging instead of failing.
  pub async fn store(&self, key: &str, cached: CachedResponse) {
    if let Err(e) = self.spawn_write(key.to_string(), cached).await {
      warn!(namespace = %self.namespace, key, error = %e, "Cache write task failed");
    }
  }

  fn spawn_write(&self, key: String, cached: CachedResponse) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.namespace.clone();
    let cached_at = self.clock.now();

    tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put_json(&namespace, &key, &cached, cached_at) {
        warn!(%namespace, key, error = %e, "Cache write failed");
      }
    })
  }

  fn store_in_background(&self, key: String, cached: CachedResponse) {
    let handle = self.spawn_write(key, cached);

    let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
    writes.retain(|h| !h.is_finished());
    writes.push(handle);
  }

  /// Wait for every background write started so far.
  pub async fn flush(&self) {
    let pending = std::mem::take(&mut *self.writes.lock().unwrap_or_else(|e| e.into_inner()));
    for handle in pending {
      if let Err(e) = handle.await {
        warn!(error = %e, "Background cache write panicked");
      }
    }
  }

  fn fallback_allowed(&self, cached_at: DateTime<Utc>) -> bool {
    match self.fallback_max_age {
      Some(max_age) => self.clock.now() - cached_at <= max_age,
      None => true,
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      namespace: self.namespace.clone(),
      fallback_max_age: self.fallback_max_age,
      writes: Arc::clone(&self.writes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::cache::StoredEntry;
  use crate::clock::ManualClock;
  use color_eyre::Result;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread::{self, ThreadId};

  /// Records the thread every entry read or write runs on.
  #[derive(Default)]
  struct ThreadRecorder {
    inner: MemoryStorage,
    threads: Mutex<Vec<ThreadId>>,
  }

  impl ThreadRecorder {
    fn record(&self) {
      self.threads.lock().unwrap().push(thread::current().id());
    }
  }

  impl CacheStorage for ThreadRecorder {
    fn open_namespace(&self, namespace: &str) -> Result<()> {
      self.inner.open_namespace(namespace)
    }
    fn namespaces(&self) -> Result<Vec<String>> {
      self.inner.namespaces()
    }
    fn delete_namespace(&self, namespace: &str) -> Result<bool> {
      self.inner.delete_namespace(namespace)
    }
    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
      self.inner.keys(namespace)
    }
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
      self.record();
      self.inner.get(namespace, key)
    }
    fn put(&self, namespace: &str, key: &str, data: &[u8], cached_at: DateTime<Utc>) -> Result<()> {
      self.record();
      self.inner.put(namespace, key, data, cached_at)
    }
    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
      self.inner.delete(namespace, key)
    }
    fn mark_active(&self, namespace: &str) -> Result<()> {
      self.inner.mark_active(namespace)
    }
    fn active_namespace(&self) -> Result<Option<String>> {
      self.inner.active_namespace()
    }
  }

  const NS: &str = "offcache-v1";

  fn layer() -> (CacheLayer<MemoryStorage>, Arc<MemoryStorage>, Arc<ManualClock>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.open_namespace(NS).unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    let layer = CacheLayer::new(Arc::clone(&storage), clock.clone(), NS);
    (layer, storage, clock)
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let (layer, _, _) = layer();

    let live = layer
      .network_first("GET /api/feed", || async { Ok::<_, String>(Response::ok("[1,2]")) })
      .await
      .unwrap();
    assert_eq!(live.source, CacheSource::Network);
    layer.flush().await;

    let fallback = layer
      .network_first("GET /api/feed", || async { Err::<Response, _>("offline".to_string()) })
      .await
      .unwrap();
    assert_eq!(fallback.source, CacheSource::Offline);
    assert_eq!(fallback.data.status, 200);
    assert_eq!(fallback.data.body, b"[1,2]");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates_error() {
    let (layer, _, _) = layer();

    let result = layer
      .network_first("GET /api/feed", || async { Err::<Response, _>("offline".to_string()) })
      .await;
    assert_eq!(result.unwrap_err(), "offline");
  }

  #[tokio::test]
  async fn test_network_first_does_not_cache_errors() {
    let (layer, storage, _) = layer();

    let result = layer
      .network_first("GET /api/feed", || async { Ok::<_, String>(Response::new(503, "busy")) })
      .await
      .unwrap();
    assert_eq!(result.data.status, 503);
    layer.flush().await;

    assert!(storage.keys(NS).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fallback_age_limit() {
    let (layer, _, clock) = layer();
    let layer = layer.with_fallback_max_age(Some(Duration::minutes(10)));

    layer
      .network_first("GET /api/feed", || async { Ok::<_, String>(Response::ok("old")) })
      .await
      .unwrap();
    layer.flush().await;

    clock.advance(Duration::minutes(5));
    let result = layer
      .network_first("GET /api/feed", || async { Err::<Response, _>("offline") })
      .await;
    assert!(result.is_ok());

    clock.advance(Duration::minutes(6));
    let result = layer
      .network_first("GET /api/feed", || async { Err::<Response, _>("offline") })
      .await;
    assert_eq!(result.unwrap_err(), "offline");
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once() {
    let (layer, _, _) = layer();
    let calls = AtomicUsize::new(0);

    for expected in [CacheSource::Network, CacheSource::Cache] {
      let result = layer
        .cache_first("GET /static/js/main.js", || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, String>(Response::ok("console.log(1)"))
        })
        .await
        .unwrap();
      assert_eq!(result.source, expected);
      assert_eq!(result.data.body, b"console.log(1)");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_with_network_failure_propagates() {
    let (layer, storage, _) = layer();

    let result = layer
      .cache_first("GET /logo.png", || async { Err::<Response, _>("offline") })
      .await;
    assert_eq!(result.unwrap_err(), "offline");
    assert!(storage.keys(NS).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_corrupt_entry_is_a_miss() {
    let (layer, storage, clock) = layer();
    let mut cached = CachedResponse::from_response(&Response::ok("good"));
    cached.body = b"bad".to_vec();
    storage.put_json(NS, "GET /", &cached, clock.now()).unwrap();

    assert!(layer.lookup("GET /").await.is_none());
  }

  #[tokio::test]
  async fn test_write_failure_does_not_fail_fetch() {
    let storage = Arc::new(MemoryStorage::new());
    // Namespace never opened, so every write fails
    let layer = CacheLayer::new(storage, Arc::new(ManualClock::at_epoch()), NS);

    let result = layer
      .network_first("GET /api/feed", || async { Ok::<_, String>(Response::ok("[]")) })
      .await;
    layer.flush().await;
    assert!(result.is_ok());

    let result = layer
      .cache_first("GET /app.js", || async { Ok::<_, String>(Response::ok("js")) })
      .await;
    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn test_storage_calls_stay_off_the_runtime_thread() {
    let storage = Arc::new(ThreadRecorder::default());
    storage.open_namespace(NS).unwrap();
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::new(ManualClock::at_epoch()), NS);
    let runtime_thread = thread::current().id();

    // Miss, fetch, store, then a hit
    for _ in 0..2 {
      layer
        .cache_first("GET /app.js", || async { Ok::<_, String>(Response::ok("js")) })
        .await
        .unwrap();
    }
    layer
      .network_first("GET /api/feed", || async { Ok::<_, String>(Response::ok("[]")) })
      .await
      .unwrap();
    layer.flush().await;
    layer
      .network_first("GET /api/feed", || async { Err::<Response, _>("offline") })
      .await
      .unwrap();

    let threads = storage.threads.lock().unwrap().clone();
    // get + put, get, put, get
    assert_eq!(threads.len(), 5);
    assert!(threads.iter().all(|id| *id != runtime_thread));
  }
}
