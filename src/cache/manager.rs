//! Cache manager that orchestrates the memory and persistent tiers.
//!
//! Construct one [`CacheManager`] at startup and hand clones of it to every
//! consumer; clones share the same tiers, statistics and in-flight map.
//!
//! The memory tier is the authoritative fast path. The persistent store is
//! best-effort durability: a crash between the memory write and the store
//! write only costs the next session its warm start.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::error::CacheError;
use super::memory::{EntryMeta, MemoryLimits, MemoryTier, SharedValue};
use super::storage::PersistentStore;
use super::traits::{Cacheable, EntryKey, Namespace, Priority, SetOptions};

/// Prefix of every key this cache writes to the persistent store.
const STORE_PREFIX: &str = "cache:";

/// Keys longer than this are hashed before hitting the store.
const MAX_STORE_KEY_LEN: usize = 128;

type InFlight = Shared<BoxFuture<'static, Result<SharedValue, CacheError>>>;

struct InFlightSlot {
  fetch: InFlight,
  /// Set when the key is removed mid-fetch; the result is then not cached
  superseded: Arc<AtomicBool>,
}

/// Process-lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub memory_hits: u64,
  pub memory_misses: u64,
  pub disk_hits: u64,
  pub disk_misses: u64,
  pub memory_size_bytes: usize,
  pub memory_entry_count: usize,
  pub evictions: u64,
  pub errors: u64,
  pub writes: u64,
}

/// Hit rates in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HitRate {
  pub memory: f64,
  pub disk: f64,
  pub overall: f64,
}

fn percent(hits: u64, misses: u64) -> f64 {
  let attempts = hits + misses;
  if attempts == 0 {
    0.0
  } else {
    hits as f64 / attempts as f64 * 100.0
  }
}

#[derive(Default)]
struct StatCounters {
  memory_hits: AtomicU64,
  memory_misses: AtomicU64,
  disk_hits: AtomicU64,
  disk_misses: AtomicU64,
  evictions: AtomicU64,
  errors: AtomicU64,
  writes: AtomicU64,
}

impl StatCounters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn add_evictions(&self, count: usize) {
    self.evictions.fetch_add(count as u64, Ordering::Relaxed);
  }
}

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  Memory,
  Disk,
}

/// A cached value together with its metadata.
///
/// Returned by [`CacheManager::lookup`], which also hands back expired values
/// so callers can fall back to them.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
  pub value: T,
  pub meta: EntryMeta,
  pub tier: Tier,
  pub is_valid: bool,
}

/// A persisted entry as listed by [`CacheManager::entries`].
#[derive(Debug, Clone)]
pub struct EntrySummary {
  pub key: EntryKey,
  pub meta: Option<EntryMeta>,
  pub in_memory: bool,
}

/// Result of an explicit expired-entry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
  pub memory: usize,
  pub persisted: usize,
}

/// On-disk envelope. Metadata reads deserialize only the header fields.
#[derive(Serialize, Deserialize)]
struct PersistedEntry<V> {
  created_at: DateTime<Utc>,
  ttl_ms: i64,
  priority: Priority,
  value: V,
}

#[derive(Deserialize)]
struct PersistedHeader {
  created_at: DateTime<Utc>,
  ttl_ms: i64,
  priority: Priority,
}

impl PersistedHeader {
  fn meta(&self, size_bytes: usize) -> EntryMeta {
    EntryMeta {
      created_at: self.created_at,
      ttl: Duration::milliseconds(self.ttl_ms),
      priority: self.priority,
      size_bytes,
    }
  }
}

impl<V> PersistedEntry<V> {
  fn meta(&self, size_bytes: usize) -> EntryMeta {
    EntryMeta {
      created_at: self.created_at,
      ttl: Duration::milliseconds(self.ttl_ms),
      priority: self.priority,
      size_bytes,
    }
  }
}

/// Store key for an entry: `cache:<namespace>:<key>`.
pub fn storage_key(key: &EntryKey) -> String {
  let key_part = if key.key.len() > MAX_STORE_KEY_LEN {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(key.key.as_bytes());
    hex::encode(hasher.finalize())
  } else {
    key.key.clone()
  };
  format!("{}{}", namespace_prefix(key.namespace), key_part)
}

fn namespace_prefix(namespace: Namespace) -> String {
  format!("{}{}:", STORE_PREFIX, namespace)
}

fn parse_storage_key(storage_key: &str) -> Option<EntryKey> {
  let rest = storage_key.strip_prefix(STORE_PREFIX)?;
  let (namespace, key) = rest.split_once(':')?;
  Some(EntryKey::new(namespace.parse().ok()?, key))
}

/// Two-tier cache with TTL, priorities and in-flight fetch de-duplication.
pub struct CacheManager {
  memory: Arc<MemoryTier>,
  store: Arc<dyn PersistentStore>,
  stats: Arc<StatCounters>,
  in_flight: Arc<Mutex<HashMap<EntryKey, InFlightSlot>>>,
  clock: Arc<dyn Clock>,
}

impl CacheManager {
  /// Create a cache manager over the given persistent store.
  pub fn new(store: Arc<dyn PersistentStore>, limits: MemoryLimits) -> Self {
    Self {
      memory: Arc::new(MemoryTier::new(limits)),
      store,
      stats: Arc::new(StatCounters::default()),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      clock: Arc::new(SystemClock),
    }
  }

  /// Replace the clock used for TTL checks.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn memory_limits(&self) -> MemoryLimits {
    self.memory.limits()
  }

  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<EntryKey, InFlightSlot>> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Detach in-flight fetches for matching keys so their results are not
  /// written back. Callers already awaiting them still get the value.
  fn supersede_in_flight(&self, matches: impl Fn(&EntryKey) -> bool) {
    self.lock_in_flight().retain(|key, slot| {
      if matches(key) {
        debug!(key = %key, "in-flight fetch superseded");
        slot.superseded.store(true, Ordering::Release);
        false
      } else {
        true
      }
    });
  }

  /// Get a valid value. Expired entries are dropped from both tiers.
  ///
  /// Never fails: store errors and undecodable records count as misses.
  pub async fn get<T: Cacheable>(&self, key: &str, namespace: Namespace) -> Option<T> {
    self
      .read::<T>(&EntryKey::new(namespace, key), true)
      .await
      .map(|lookup| lookup.value)
  }

  /// Like [`get`](Self::get) but also returns expired values, flagged
  /// invalid, and leaves them in place.
  pub async fn lookup<T: Cacheable>(&self, key: &str, namespace: Namespace) -> Option<Lookup<T>> {
    self.read::<T>(&EntryKey::new(namespace, key), false).await
  }

  async fn read<T: Cacheable>(&self, key: &EntryKey, drop_expired: bool) -> Option<Lookup<T>> {
    let now = self.clock.now();

    if let Some((value, meta)) = self.memory.get(key) {
      let is_valid = meta.is_valid_at(now);
      match value.downcast_ref::<T>() {
        Some(value) if is_valid => {
          StatCounters::bump(&self.stats.memory_hits);
          return Some(Lookup {
            value: value.clone(),
            meta,
            tier: Tier::Memory,
            is_valid,
          });
        }
        Some(value) => {
          StatCounters::bump(&self.stats.memory_misses);
          if drop_expired {
            debug!(key = %key, "expired in memory tier");
            self.drop_entry(key).await;
            return None;
          }
          return Some(Lookup {
            value: value.clone(),
            meta,
            tier: Tier::Memory,
            is_valid,
          });
        }
        None => {
          // Another type was stored under this key; try decoding from disk
          StatCounters::bump(&self.stats.errors);
          StatCounters::bump(&self.stats.memory_misses);
          warn!(key = %key, "memory tier holds a value of another type");
        }
      }
    } else {
      StatCounters::bump(&self.stats.memory_misses);
    }

    let storage_key = storage_key(key);
    let bytes = match self.store.get_item(&storage_key).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => {
        StatCounters::bump(&self.stats.disk_misses);
        return None;
      }
      Err(e) => {
        StatCounters::bump(&self.stats.errors);
        StatCounters::bump(&self.stats.disk_misses);
        warn!(key = %key, error = %e, "persistent store read failed");
        return None;
      }
    };

    let persisted: PersistedEntry<T> = match serde_json::from_slice(&bytes) {
      Ok(persisted) => persisted,
      Err(e) => {
        StatCounters::bump(&self.stats.errors);
        StatCounters::bump(&self.stats.disk_misses);
        warn!(key = %key, error = %e, "dropping undecodable cache record");
        self.drop_entry(key).await;
        return None;
      }
    };

    let meta = persisted.meta(bytes.len());
    if !meta.is_valid_at(now) {
      StatCounters::bump(&self.stats.disk_misses);
      if drop_expired {
        debug!(key = %key, "expired in persistent tier");
        self.drop_entry(key).await;
        return None;
      }
      return Some(Lookup {
        value: persisted.value,
        meta,
        tier: Tier::Disk,
        is_valid: false,
      });
    }

    StatCounters::bump(&self.stats.disk_hits);

    // Promote into the memory tier with the original timestamps
    let outcome = self
      .memory
      .insert(key.clone(), Arc::new(persisted.value.clone()), meta);
    self.stats.add_evictions(outcome.evicted);

    Some(Lookup {
      value: persisted.value,
      meta,
      tier: Tier::Disk,
      is_valid: true,
    })
  }

  /// Remove an entry from both tiers, logging store failures.
  async fn drop_entry(&self, key: &EntryKey) {
    self.memory.remove(key);
    if let Err(e) = self.store.remove_item(&storage_key(key)).await {
      StatCounters::bump(&self.stats.errors);
      warn!(key = %key, error = %e, "failed to drop cache record");
    }
  }

  /// Write a value to both tiers, replacing any previous entry.
  ///
  /// The memory tier is updated before the store write starts. A failed
  /// store write is logged and counted but doesn't fail the call; only a
  /// value that can't be serialized does.
  pub async fn set<T: Cacheable>(
    &self,
    key: &str,
    value: &T,
    options: SetOptions,
  ) -> Result<(), CacheError> {
    let entry_key = EntryKey::new(options.namespace, key);
    let created_at = self.clock.now();

    let persisted = PersistedEntry {
      created_at,
      ttl_ms: options.ttl.num_milliseconds(),
      priority: options.priority,
      value,
    };
    let bytes = serde_json::to_vec(&persisted).map_err(|e| {
      StatCounters::bump(&self.stats.errors);
      CacheError::Serialization {
        key: entry_key.to_string(),
        message: e.to_string(),
      }
    })?;

    let meta = EntryMeta {
      created_at,
      ttl: options.ttl,
      priority: options.priority,
      size_bytes: bytes.len(),
    };

    let outcome = self
      .memory
      .insert(entry_key.clone(), Arc::new(value.clone()), meta);
    StatCounters::bump(&self.stats.writes);
    self.stats.add_evictions(outcome.evicted);
    if outcome.rejected {
      debug!(
        key = %entry_key,
        size = bytes.len(),
        "entry not kept in memory tier, persisting only"
      );
    }

    if let Err(e) = self.store.set_item(&storage_key(&entry_key), &bytes).await {
      StatCounters::bump(&self.stats.errors);
      warn!(key = %entry_key, error = %e, "persistent store write failed");
    }

    Ok(())
  }

  /// Remove an entry from both tiers.
  pub async fn remove(&self, key: &str, namespace: Namespace) -> Result<(), CacheError> {
    let entry_key = EntryKey::new(namespace, key);
    self.supersede_in_flight(|k| *k == entry_key);
    self.memory.remove(&entry_key);
    self
      .store
      .remove_item(&storage_key(&entry_key))
      .await
      .map_err(|e| {
        StatCounters::bump(&self.stats.errors);
        CacheError::store(e)
      })
  }

  /// Whether a valid entry exists. Doesn't promote or count as a read.
  pub async fn has(&self, key: &str, namespace: Namespace) -> bool {
    let entry_key = EntryKey::new(namespace, key);
    let now = self.clock.now();

    if let Some(meta) = self.memory.meta(&entry_key) {
      return meta.is_valid_at(now);
    }

    self
      .persisted_meta(&entry_key)
      .await
      .is_some_and(|meta| meta.is_valid_at(now))
  }

  /// Timestamp/TTL introspection without deserializing the value.
  /// Expired entries are reported too.
  pub async fn get_metadata(&self, key: &str, namespace: Namespace) -> Option<EntryMeta> {
    let entry_key = EntryKey::new(namespace, key);
    match self.memory.meta(&entry_key) {
      Some(meta) => Some(meta),
      None => self.persisted_meta(&entry_key).await,
    }
  }

  async fn persisted_meta(&self, key: &EntryKey) -> Option<EntryMeta> {
    let bytes = match self.store.get_item(&storage_key(key)).await {
      Ok(bytes) => bytes?,
      Err(e) => {
        StatCounters::bump(&self.stats.errors);
        warn!(key = %key, error = %e, "persistent store read failed");
        return None;
      }
    };

    match serde_json::from_slice::<PersistedHeader>(&bytes) {
      Ok(header) => Some(header.meta(bytes.len())),
      Err(e) => {
        StatCounters::bump(&self.stats.errors);
        warn!(key = %key, error = %e, "undecodable cache record header");
        None
      }
    }
  }

  /// Drop every entry of `namespace` from both tiers, and nothing else.
  ///
  /// Every persisted key is attempted; the first store error is returned.
  pub async fn clear_namespace(&self, namespace: Namespace) -> Result<(), CacheError> {
    self.supersede_in_flight(|k| k.namespace == namespace);
    let dropped = self.memory.clear_namespace(namespace);
    debug!(namespace = %namespace, dropped, "cleared namespace from memory tier");
    self.clear_persisted(&namespace_prefix(namespace)).await
  }

  /// Drop everything this cache owns from both tiers.
  pub async fn clear_all(&self) -> Result<(), CacheError> {
    self.supersede_in_flight(|_| true);
    self.memory.clear();
    self.clear_persisted(STORE_PREFIX).await
  }

  async fn clear_persisted(&self, prefix: &str) -> Result<(), CacheError> {
    let keys = self.store.keys_with_prefix(prefix).await.map_err(|e| {
      StatCounters::bump(&self.stats.errors);
      CacheError::store(e)
    })?;

    let mut first_error = None;
    for key in keys {
      if let Err(e) = self.store.remove_item(&key).await {
        StatCounters::bump(&self.stats.errors);
        warn!(key = %key, error = %e, "failed to remove cache record");
        first_error.get_or_insert(CacheError::store(e));
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Remove expired entries from both tiers.
  ///
  /// Reads already treat expired entries as absent; this only reclaims space
  /// for entries that are never read again.
  pub async fn cleanup_expired(&self) -> Result<PruneReport, CacheError> {
    let now = self.clock.now();
    let mut report = PruneReport::default();

    for key in self.memory.expired_keys(now) {
      if self.memory.remove(&key) {
        report.memory += 1;
      }
    }

    let keys = self
      .store
      .keys_with_prefix(STORE_PREFIX)
      .await
      .map_err(CacheError::store)?;

    for storage_key in keys {
      let Ok(Some(bytes)) = self.store.get_item(&storage_key).await else {
        continue;
      };
      let expired = match serde_json::from_slice::<PersistedHeader>(&bytes) {
        Ok(header) => !header.meta(bytes.len()).is_valid_at(now),
        Err(_) => true,
      };
      if expired {
        match self.store.remove_item(&storage_key).await {
          Ok(()) => report.persisted += 1,
          Err(e) => warn!(key = %storage_key, error = %e, "failed to prune cache record"),
        }
      }
    }

    debug!(memory = report.memory, persisted = report.persisted, "pruned expired entries");
    Ok(report)
  }

  /// List entries in both tiers, optionally limited to one namespace.
  pub async fn entries(
    &self,
    namespace: Option<Namespace>,
  ) -> Result<Vec<EntrySummary>, CacheError> {
    let prefix = namespace.map_or_else(|| STORE_PREFIX.to_string(), namespace_prefix);
    let persisted = self
      .store
      .keys_with_prefix(&prefix)
      .await
      .map_err(CacheError::store)?;

    let mut summaries: BTreeMap<EntryKey, EntrySummary> = BTreeMap::new();

    for key in self.memory.keys() {
      if namespace.is_some_and(|ns| ns != key.namespace) {
        continue;
      }
      let meta = self.memory.meta(&key);
      summaries.insert(
        key.clone(),
        EntrySummary {
          key,
          meta,
          in_memory: true,
        },
      );
    }

    for storage_key in persisted {
      let Some(key) = parse_storage_key(&storage_key) else {
        continue;
      };
      if summaries.contains_key(&key) {
        continue;
      }
      let meta = self.persisted_meta(&key).await;
      summaries.insert(
        key.clone(),
        EntrySummary {
          key,
          meta,
          in_memory: false,
        },
      );
    }

    Ok(summaries.into_values().collect())
  }

  /// Snapshot of the counters plus current memory usage.
  pub fn get_stats(&self) -> CacheStats {
    let (memory_size_bytes, memory_entry_count) = self.memory.usage();
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

    CacheStats {
      memory_hits: load(&self.stats.memory_hits),
      memory_misses: load(&self.stats.memory_misses),
      disk_hits: load(&self.stats.disk_hits),
      disk_misses: load(&self.stats.disk_misses),
      memory_size_bytes,
      memory_entry_count,
      evictions: load(&self.stats.evictions),
      errors: load(&self.stats.errors),
      writes: load(&self.stats.writes),
    }
  }

  /// Per-tier and overall hit rate in percent; 0 when nothing was read yet.
  pub fn get_hit_rate(&self) -> HitRate {
    let stats = self.get_stats();
    HitRate {
      memory: percent(stats.memory_hits, stats.memory_misses),
      disk: percent(stats.disk_hits, stats.disk_misses),
      overall: percent(
        stats.memory_hits + stats.disk_hits,
        stats.memory_misses + stats.disk_misses,
      ),
    }
  }

  /// Return a valid cached value, or fetch, cache and return a fresh one.
  pub async fn get_or_fetch<T, F, Fut>(
    &self,
    key: &str,
    options: SetOptions,
    fetcher: F,
  ) -> Result<T, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    if let Some(value) = self.get::<T>(key, options.namespace).await {
      return Ok(value);
    }
    self.fetch_and_store(key, options, fetcher).await
  }

  /// Run `fetcher` and write its result to the cache.
  ///
  /// Concurrent calls for the same `(namespace, key)` share one fetch: later
  /// callers await the in-flight result instead of calling their own
  /// fetcher. The in-flight slot is cleared when the fetch completes.
  ///
  /// If the key is removed or its namespace cleared while the fetch runs,
  /// the result is still returned but not cached, and later callers start a
  /// new fetch.
  pub async fn fetch_and_store<T, F, Fut>(
    &self,
    key: &str,
    options: SetOptions,
    fetcher: F,
  ) -> Result<T, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let entry_key = EntryKey::new(options.namespace, key);

    let pending = {
      let mut in_flight = self.lock_in_flight();
      match in_flight.get(&entry_key) {
        Some(pending) => {
          debug!(key = %entry_key, "joining in-flight fetch");
          pending.fetch.clone()
        }
        None => {
          let cache = self.clone();
          let slot = entry_key.clone();
          let superseded = Arc::new(AtomicBool::new(false));
          let flag = Arc::clone(&superseded);
          let pending = async move {
            let result = match fetcher().await {
              Ok(value) => {
                cache.write_back(&slot, &value, options, &flag).await;
                Ok(Arc::new(value) as SharedValue)
              }
              Err(report) => Err(CacheError::fetch(report)),
            };
            let mut in_flight = cache.lock_in_flight();
            // A superseded slot may already have been replaced by a newer fetch
            if in_flight
              .get(&slot)
              .is_some_and(|current| Arc::ptr_eq(&current.superseded, &flag))
            {
              in_flight.remove(&slot);
            }
            result
          }
          .boxed()
          .shared();
          in_flight.insert(
            entry_key.clone(),
            InFlightSlot {
              fetch: pending.clone(),
              superseded,
            },
          );
          pending
        }
      }
    };

    let value = pending.await?;
    value
      .downcast_ref::<T>()
      .cloned()
      .ok_or_else(|| CacheError::TypeMismatch {
        key: entry_key.to_string(),
      })
  }

  async fn write_back<T: Cacheable>(
    &self,
    key: &EntryKey,
    value: &T,
    options: SetOptions,
    superseded: &AtomicBool,
  ) {
    if superseded.load(Ordering::Acquire) {
      debug!(key = %key, "entry removed during fetch, not caching result");
      return;
    }
    if let Err(e) = self.set(&key.key, value, options).await {
      warn!(key = %key, error = %e, "failed to cache fetched value");
    }
    // Removed while the write was in progress
    if superseded.load(Ordering::Acquire) {
      self.drop_entry(key).await;
    }
  }

  /// Fire-and-forget [`fetch_and_store`](Self::fetch_and_store). Failures
  /// are logged and swallowed; the task can't be cancelled once started.
  pub fn spawn_refresh<T, F, Fut>(
    &self,
    key: &str,
    options: SetOptions,
    fetcher: F,
  ) -> JoinHandle<()>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let cache = self.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      match cache.fetch_and_store::<T, _, _>(&key, options, fetcher).await {
        Ok(_) => debug!(namespace = %options.namespace, key = %key, "background refresh done"),
        Err(e) => warn!(
          namespace = %options.namespace,
          key = %key,
          error = %e,
          "background refresh failed"
        ),
      }
    })
  }

  /// Number of fetches currently in flight.
  pub fn in_flight_count(&self) -> usize {
    self.lock_in_flight().len()
  }
}

impl Clone for CacheManager {
  fn clone(&self) -> Self {
    Self {
      memory: Arc::clone(&self.memory),
      store: Arc::clone(&self.store),
      stats: Arc::clone(&self.stats),
      in_flight: Arc::clone(&self.in_flight),
      clock: Arc::clone(&self.clock),
    }
  }
}
