//! Persistent store trait and SQLite implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db::Database;

/// Durable key-value store backing the cache.
///
/// Values are opaque bytes. Every operation may fail with a transient
/// I/O error; the cache treats those as misses or logged write failures.
#[async_trait]
pub trait PersistentStore: Send + Sync {
  /// Read the bytes stored under `key`.
  async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store `value` under `key`, replacing any previous value.
  async fn set_item(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  async fn remove_item(&self, key: &str) -> Result<()>;

  /// List every key starting with `prefix`.
  async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Store implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

#[async_trait]
impl PersistentStore for NoopStore {
  async fn get_item(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  async fn set_item(&self, _key: &str, _value: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  async fn remove_item(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-based persistent store.
pub struct SqliteStore {
  db: Mutex<Database>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Ok(Self::from_database(Database::open_default()?))
  }

  /// Open the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::from_database(Database::open(path)?))
  }

  /// Open a store that vanishes when dropped.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  pub fn from_database(db: Database) -> Self {
    Self { db: Mutex::new(db) }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Database>> {
    self.db.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl PersistentStore for SqliteStore {
  async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let db = self.lock()?;

    db.conn()
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  async fn set_item(&self, key: &str, value: &[u8]) -> Result<()> {
    let db = self.lock()?;

    db.conn()
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  async fn remove_item(&self, key: &str) -> Result<()> {
    let db = self.lock()?;

    db.conn()
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }

  async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let db = self.lock()?;

    // substr comparison avoids LIKE wildcard escaping
    let mut stmt = db
      .conn()
      .prepare("SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key scan: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_get_remove() {
    let store = SqliteStore::open_in_memory().unwrap();

    assert_eq!(store.get_item("a").await.unwrap(), None);

    store.set_item("a", b"one").await.unwrap();
    store.set_item("a", b"two").await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap(), Some(b"two".to_vec()));

    store.remove_item("a").await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap(), None);

    // Removing again is fine
    store.remove_item("a").await.unwrap();
  }

  #[tokio::test]
  async fn test_keys_with_prefix_is_literal() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set_item("cache:stats:x", b"1").await.unwrap();
    store.set_item("cache:stats:y", b"1").await.unwrap();
    store.set_item("cache:stats_other:z", b"1").await.unwrap();
    store.set_item("cache:history:x", b"1").await.unwrap();

    let keys = store.keys_with_prefix("cache:stats:").await.unwrap();
    assert_eq!(keys, vec!["cache:stats:x", "cache:stats:y"]);

    // '_' and '%' are not wildcards
    assert!(store.keys_with_prefix("cache:st_ts:").await.unwrap().is_empty());
    assert!(store.keys_with_prefix("cache:%").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set_item("k", b"v").await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get_item("k").await.unwrap(), Some(b"v".to_vec()));
  }

  #[tokio::test]
  async fn test_noop_store_never_hits() {
    let store = NoopStore;
    store.set_item("k", b"v").await.unwrap();
    assert_eq!(store.get_item("k").await.unwrap(), None);
    assert!(store.keys_with_prefix("").await.unwrap().is_empty());
  }
}
