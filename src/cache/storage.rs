//! Cache storage trait, in-memory and SQLite implementations.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::traits::StoredEntry;
use crate::db::Database;

/// Trait for cache storage backends.
///
/// Storage is a set of named namespaces, each holding blobs keyed by string.
/// Writing into a namespace that does not exist fails; namespaces are created
/// with [`CacheStorage::open_namespace`]. A write racing a namespace deletion
/// therefore fails instead of resurrecting the namespace.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &str) -> Result<()>;

  /// All namespace names, sorted.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and everything in it. Returns false if it did not exist.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Keys stored in a namespace, sorted.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;

  /// Read a single entry.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>>;

  /// Insert or replace a single entry.
  fn put(&self, namespace: &str, key: &str, data: &[u8], cached_at: DateTime<Utc>) -> Result<()>;

  /// Delete a single entry. Returns false if it did not exist.
  fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

  /// Mark an existing namespace as the active one, clearing any other mark.
  fn mark_active(&self, namespace: &str) -> Result<()>;

  /// The namespace last marked active, if it still exists.
  fn active_namespace(&self) -> Result<Option<String>>;

  /// Read an entry and decode it as JSON.
  fn get_json<T: DeserializeOwned>(
    &self,
    namespace: &str,
    key: &str,
  ) -> Result<Option<(T, DateTime<Utc>)>>
  where
    Self: Sized,
  {
    match self.get(namespace, key)? {
      Some(entry) => {
        let value = serde_json::from_slice(&entry.data)
          .map_err(|e| eyre!("Failed to deserialize entry {}/{}: {}", namespace, key, e))?;
        Ok(Some((value, entry.cached_at)))
      }
      None => Ok(None),
    }
  }

  /// Encode a value as JSON and store it.
  fn put_json<T: Serialize>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    cached_at: DateTime<Utc>,
  ) -> Result<()>
  where
    Self: Sized,
  {
    let data = serde_json::to_vec(value)
      .map_err(|e| eyre!("Failed to serialize entry {}/{}: {}", namespace, key, e))?;
    self.put(namespace, key, &data, cached_at)
  }
}

#[derive(Default)]
struct MemoryState {
  namespaces: BTreeMap<String, HashMap<String, StoredEntry>>,
  active: Option<String>,
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    self
      .lock()?
      .namespaces
      .entry(namespace.to_string())
      .or_default();
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.namespaces.keys().cloned().collect())
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut state = self.lock()?;
    if state.active.as_deref() == Some(namespace) {
      state.active = None;
    }
    Ok(state.namespaces.remove(namespace).is_some())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let guard = self.lock()?;
    let mut keys: Vec<String> = guard
      .namespaces
      .get(namespace)
      .map(|entries| entries.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    Ok(keys)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
    Ok(
      self
        .lock()?
        .namespaces
        .get(namespace)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, namespace: &str, key: &str, data: &[u8], cached_at: DateTime<Utc>) -> Result<()> {
    let mut guard = self.lock()?;
    let entries = guard
      .namespaces
      .get_mut(namespace)
      .ok_or_else(|| eyre!("Namespace {} does not exist", namespace))?;
    entries.insert(
      key.to_string(),
      StoredEntry {
        data: data.to_vec(),
        cached_at,
      },
    );
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
    Ok(
      self
        .lock()?
        .namespaces
        .get_mut(namespace)
        .map(|entries| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn mark_active(&self, namespace: &str) -> Result<()> {
    let mut state = self.lock()?;
    if !state.namespaces.contains_key(namespace) {
      return Err(eyre!("Namespace {} does not exist", namespace));
    }
    state.active = Some(namespace.to_string());
    Ok(())
  }

  fn active_namespace(&self) -> Result<Option<String>> {
    Ok(self.lock()?.active.clone())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Mutex<Database>,
}

impl SqliteStorage {
  /// Open (or create) a storage file at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      db: Mutex::new(Database::open(path)?),
    })
  }

  /// Open a private in-memory storage.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      db: Mutex::new(Database::open_in_memory()?),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
    self.db.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    let db = self.lock()?;
    db.conn()
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let db = self.lock()?;
    let mut stmt = db
      .conn()
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let db = self.lock()?;
    // Entries go with it via ON DELETE CASCADE
    let deleted = db
      .conn()
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;
    Ok(deleted > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let db = self.lock()?;
    let mut stmt = db
      .conn()
      .prepare("SELECT entry_key FROM cache_entries WHERE namespace = ? ORDER BY entry_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys in {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
    let db = self.lock()?;
    let row: Option<(Vec<u8>, i64)> = db
      .conn()
      .query_row(
        "SELECT data, cached_at FROM cache_entries WHERE namespace = ? AND entry_key = ?",
        params![namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}/{}: {}", namespace, key, e))?;

    match row {
      Some((data, cached_at)) => Ok(Some(StoredEntry {
        data,
        cached_at: parse_millis(cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &str, data: &[u8], cached_at: DateTime<Utc>) -> Result<()> {
    let db = self.lock()?;
    db.conn()
      .execute(
        "INSERT OR REPLACE INTO cache_entries (namespace, entry_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![namespace, key, data, cached_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store entry {}/{}: {}", namespace, key, e))?;
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
    let db = self.lock()?;
    let deleted = db
      .conn()
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND entry_key = ?",
        params![namespace, key],
      )
      .map_err(|e| eyre!("Failed to delete entry {}/{}: {}", namespace, key, e))?;
    Ok(deleted > 0)
  }

  fn mark_active(&self, namespace: &str) -> Result<()> {
    let mut db = self.lock()?;
    let tx = db
      .conn_mut()
      .transaction()
      .map_err(|e| eyre!("Failed to start transaction: {}", e))?;

    let marked = tx
      .execute(
        "UPDATE cache_namespaces SET active = (name = ?)",
        params![namespace],
      )
      .and_then(|_| {
        tx.query_row(
          "SELECT COUNT(*) FROM cache_namespaces WHERE active = 1",
          [],
          |row| row.get::<_, i64>(0),
        )
      })
      .map_err(|e| eyre!("Failed to mark namespace {} active: {}", namespace, e))?;

    if marked == 0 {
      // Dropping the transaction rolls it back
      return Err(eyre!("Namespace {} does not exist", namespace));
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to mark namespace {} active: {}", namespace, e))
  }

  fn active_namespace(&self) -> Result<Option<String>> {
    let db = self.lock()?;
    db.conn()
      .query_row(
        "SELECT name FROM cache_namespaces WHERE active = 1 LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active namespace: {}", e))
  }
}

/// Convert a stored millisecond timestamp back into a datetime.
fn parse_millis(millis: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp: {}", millis))
}
