//! Structured local cache for the content feed.
//!
//! Holds at most one snapshot of the feed under a single well-known key.
//! Freshness is checked when asked; nothing here ever refetches or evicts
//! on its own. Every storage failure is logged and treated as "no cache".

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::clock::Clock;

/// Namespace of the local store the feed snapshot lives in.
pub const FEED_NAMESPACE: &str = "local";

/// Key of the single feed snapshot.
pub const FEED_KEY: &str = "feed_cache";

/// Age in seconds after which the snapshot is stale.
pub const FEED_TTL_SECS: i64 = 1800;

/// The stored value: items in feed order plus capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot<T> {
  pub items: Vec<T>,
  /// Milliseconds since the epoch
  pub timestamp: i64,
}

impl<T> FeedSnapshot<T> {
  pub fn captured_at(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.timestamp).single()
  }
}

pub struct StructuredFeedCache<S: CacheStorage, T> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  ttl: Duration,
  _items: PhantomData<fn() -> T>,
}

impl<S, T> StructuredFeedCache<S, T>
where
  S: CacheStorage,
  T: Serialize + DeserializeOwned,
{
  pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    if let Err(e) = storage.open_namespace(FEED_NAMESPACE) {
      warn!(error = %e, "Failed to open feed cache namespace");
    }

    Self {
      storage,
      clock,
      ttl: Duration::seconds(FEED_TTL_SECS),
      _items: PhantomData,
    }
  }

  /// Override the staleness window.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Replace the snapshot with `items`, stamped with the current time.
  pub fn capture(&self, items: Vec<T>) {
    let now = self.clock.now();
    let snapshot = FeedSnapshot {
      items,
      timestamp: now.timestamp_millis(),
    };

    // The namespace may have been cleared out from under us
    let written = self
      .storage
      .open_namespace(FEED_NAMESPACE)
      .and_then(|_| self.storage.put_json(FEED_NAMESPACE, FEED_KEY, &snapshot, now));

    match written {
      Ok(()) => debug!(items = snapshot.items.len(), "Captured feed snapshot"),
      Err(e) => warn!(error = %e, "Failed to store feed snapshot"),
    }
  }

  /// The current snapshot, if any.
  pub fn snapshot(&self) -> Option<FeedSnapshot<T>> {
    match self
      .storage
      .get_json::<FeedSnapshot<T>>(FEED_NAMESPACE, FEED_KEY)
    {
      Ok(found) => found.map(|(snapshot, _)| snapshot),
      Err(e) => {
        warn!(error = %e, "Failed to read feed snapshot");
        None
      }
    }
  }

  /// Items of the current snapshot, or nothing.
  pub fn read(&self) -> Vec<T> {
    self.snapshot().map(|s| s.items).unwrap_or_default()
  }

  /// Age of the snapshot, if there is one.
  pub fn age(&self) -> Option<Duration> {
    self
      .snapshot()
      .map(|s| Duration::milliseconds(self.clock.now_millis() - s.timestamp))
  }

  /// True without a snapshot, or once it is older than the TTL.
  pub fn is_stale(&self) -> bool {
    match self.age() {
      Some(age) => age > self.ttl,
      None => true,
    }
  }

  /// Drop the snapshot. Clearing an empty cache is a no-op.
  pub fn clear(&self) {
    match self.storage.delete(FEED_NAMESPACE, FEED_KEY) {
      Ok(true) => debug!("Cleared feed snapshot"),
      Ok(false) => {}
      Err(e) => warn!(error = %e, "Failed to clear feed snapshot"),
    }
  }

  /// Short human readable age for status lines.
  pub fn age_display(&self) -> String {
    match self.age() {
      Some(age) => format_age(age),
      None => "never".to_string(),
    }
  }
}

/// Format an age as "just now", "5m ago", "2h ago" or "3d ago".
///
/// Hours and days round up from the half mark.
pub fn format_age(age: Duration) -> String {
  let minutes = age.num_minutes();
  if minutes < 1 {
    // Also covers clock skew
    "just now".to_string()
  } else if minutes < 60 {
    format!("{}m ago", minutes)
  } else if minutes < 1440 {
    let hours = minutes / 60;
    if minutes % 60 >= 30 {
      format!("{}h ago", hours + 1)
    } else {
      format!("{}h ago", hours)
    }
  } else {
    let days = minutes / 1440;
    if (minutes % 1440) / 60 >= 12 {
      format!("{}d ago", days + 1)
    } else {
      format!("{}d ago", days)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::clock::ManualClock;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Post {
    id: u32,
    title: String,
  }

  fn post(id: u32) -> Post {
    Post {
      id,
      title: format!("post {}", id),
    }
  }

  fn feed() -> (StructuredFeedCache<MemoryStorage, Post>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let cache = StructuredFeedCache::new(Arc::new(MemoryStorage::new()), clock.clone());
    (cache, clock)
  }

  #[test]
  fn test_read_without_snapshot_is_empty() {
    let (cache, _) = feed();
    assert!(cache.read().is_empty());
    assert!(cache.snapshot().is_none());
    assert!(cache.is_stale());
    assert_eq!(cache.age_display(), "never");
  }

  #[test]
  fn test_read_preserves_order() {
    let (cache, _) = feed();
    cache.capture(vec![post(3), post(1), post(2)]);
    assert_eq!(cache.read(), vec![post(3), post(1), post(2)]);
  }

  #[test]
  fn test_capture_replaces() {
    let (cache, clock) = feed();
    cache.capture(vec![post(1), post(2)]);
    clock.advance(Duration::seconds(5));
    cache.capture(vec![post(9)]);

    let snapshot = cache.snapshot().unwrap();
    assert_eq!(snapshot.items, vec![post(9)]);
    assert_eq!(snapshot.timestamp, 5_000);
  }

  #[test]
  fn test_twenty_items_go_stale_after_ttl() {
    let (cache, clock) = feed();
    cache.capture((0..20).map(post).collect());
    assert!(!cache.is_stale());

    clock.advance(Duration::seconds(1000));
    assert!(!cache.is_stale());

    clock.advance(Duration::seconds(900));
    assert!(cache.is_stale());
    // Stale data is still readable
    assert_eq!(cache.read().len(), 20);
  }

  #[test]
  fn test_staleness_boundary() {
    let (cache, clock) = feed();
    cache.capture(vec![post(1)]);

    clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1799));
    assert!(!cache.is_stale());

    clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1800));
    assert!(!cache.is_stale());

    clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1801));
    assert!(cache.is_stale());
  }

  #[test]
  fn test_clear_is_idempotent() {
    let (cache, _) = feed();
    cache.capture(vec![post(1)]);
    assert!(!cache.is_stale());

    cache.clear();
    assert!(cache.is_stale());
    assert!(cache.read().is_empty());

    cache.clear();
    assert!(cache.read().is_empty());
  }

  #[test]
  fn test_custom_ttl() {
    let (cache, clock) = feed();
    let cache = cache.with_ttl(Duration::seconds(60));
    cache.capture(vec![post(1)]);
    clock.advance(Duration::seconds(61));
    assert!(cache.is_stale());
  }

  #[test]
  fn test_snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let clock = Arc::new(ManualClock::at_epoch());

    {
      let storage = Arc::new(SqliteStorage::open(&path).unwrap());
      let cache: StructuredFeedCache<_, Post> = StructuredFeedCache::new(storage, clock.clone());
      cache.capture(vec![post(1), post(2)]);
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let cache: StructuredFeedCache<_, Post> = StructuredFeedCache::new(storage, clock);
    assert_eq!(cache.read(), vec![post(1), post(2)]);
  }

  #[test]
  fn test_unreadable_snapshot_counts_as_absent() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let cache: StructuredFeedCache<_, Post> =
      StructuredFeedCache::new(Arc::clone(&storage), clock.clone());

    storage
      .put(FEED_NAMESPACE, FEED_KEY, b"not json", clock.now())
      .unwrap();
    assert!(cache.read().is_empty());
    assert!(cache.is_stale());
  }

  #[test]
  fn test_format_age() {
    assert_eq!(format_age(Duration::seconds(-30)), "just now");
    assert_eq!(format_age(Duration::seconds(30)), "just now");
    assert_eq!(format_age(Duration::minutes(5)), "5m ago");
    assert_eq!(format_age(Duration::minutes(89)), "1h ago");
    assert_eq!(format_age(Duration::minutes(90)), "2h ago");
    assert_eq!(format_age(Duration::hours(36)), "2d ago");
    assert_eq!(format_age(Duration::hours(30)), "1d ago");
  }
}
