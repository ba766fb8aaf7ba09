//! Bounded in-process tier holding deserialized values.

use chrono::{DateTime, Duration, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{EntryKey, Namespace, Priority};

/// Type-erased cached value.
pub(crate) type SharedValue = Arc<dyn Any + Send + Sync>;

/// Memory tier bounds. Both are enforced after every insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
  pub max_bytes: usize,
  pub max_entries: usize,
}

impl Default for MemoryLimits {
  fn default() -> Self {
    Self {
      max_bytes: 5 * 1024 * 1024,
      max_entries: 500,
    }
  }
}

/// Entry metadata shared by both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
  pub created_at: DateTime<Utc>,
  pub ttl: Duration,
  pub priority: Priority,
  /// Serialized size in bytes
  pub size_bytes: usize,
}

impl EntryMeta {
  pub fn expires_at(&self) -> DateTime<Utc> {
    self.created_at + self.ttl
  }

  /// Valid iff `now < created_at + ttl`.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at()
  }
}

pub(crate) struct MemoryEntry {
  pub value: SharedValue,
  pub meta: EntryMeta,
  last_access: u64,
}

/// What an insert did to the tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InsertOutcome {
  pub evicted: usize,
  /// The entry was not kept: it alone exceeds the byte bound, or everything
  /// else in the tier outranks it
  pub rejected: bool,
}

#[derive(Default)]
struct MemoryState {
  entries: HashMap<EntryKey, MemoryEntry>,
  total_bytes: usize,
  /// Monotonic access counter; avoids ties from coarse clocks
  tick: u64,
}

impl MemoryState {
  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  fn remove(&mut self, key: &EntryKey) -> Option<MemoryEntry> {
    let entry = self.entries.remove(key)?;
    self.total_bytes = self.total_bytes.saturating_sub(entry.meta.size_bytes);
    Some(entry)
  }

  /// Lowest priority first, then least recently used.
  fn eviction_candidate(&self) -> Option<EntryKey> {
    self
      .entries
      .iter()
      .min_by_key(|(_, entry)| (entry.meta.priority, entry.last_access))
      .map(|(key, _)| key.clone())
  }
}

/// Priority-aware LRU map bounded by bytes and entry count.
pub struct MemoryTier {
  state: Mutex<MemoryState>,
  limits: MemoryLimits,
}

impl MemoryTier {
  pub fn new(limits: MemoryLimits) -> Self {
    Self {
      state: Mutex::new(MemoryState::default()),
      limits,
    }
  }

  pub fn limits(&self) -> MemoryLimits {
    self.limits
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    // No critical section can leave the map half-updated
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Look up an entry and mark it as recently used.
  pub(crate) fn get(&self, key: &EntryKey) -> Option<(SharedValue, EntryMeta)> {
    let mut state = self.lock();
    let tick = state.next_tick();
    let entry = state.entries.get_mut(key)?;
    entry.last_access = tick;
    Some((Arc::clone(&entry.value), entry.meta))
  }

  /// Metadata without touching recency.
  pub fn meta(&self, key: &EntryKey) -> Option<EntryMeta> {
    self.lock().entries.get(key).map(|entry| entry.meta)
  }

  /// Insert or replace an entry, evicting until both bounds hold.
  ///
  /// The new entry competes for its slot like any other; when it ranks
  /// lowest it is dropped instead of an entry of higher priority.
  pub(crate) fn insert(
    &self,
    key: EntryKey,
    value: SharedValue,
    meta: EntryMeta,
  ) -> InsertOutcome {
    let mut state = self.lock();
    state.remove(&key);

    if meta.size_bytes > self.limits.max_bytes || self.limits.max_entries == 0 {
      return InsertOutcome {
        evicted: 0,
        rejected: true,
      };
    }

    let last_access = state.next_tick();
    state.total_bytes += meta.size_bytes;
    state.entries.insert(
      key.clone(),
      MemoryEntry {
        value,
        meta,
        last_access,
      },
    );

    let mut evicted = 0;
    while state.entries.len() > self.limits.max_entries || state.total_bytes > self.limits.max_bytes
    {
      let Some(victim) = state.eviction_candidate() else {
        break;
      };
      if victim == key {
        // Bounds held before this insert, so dropping it restores them
        state.remove(&key);
        return InsertOutcome {
          evicted,
          rejected: true,
        };
      }
      if let Some(entry) = state.remove(&victim) {
        tracing::debug!(
          key = %victim,
          priority = ?entry.meta.priority,
          "evicted from memory tier"
        );
      }
      evicted += 1;
    }

    InsertOutcome {
      evicted,
      rejected: false,
    }
  }

  pub fn remove(&self, key: &EntryKey) -> bool {
    self.lock().remove(key).is_some()
  }

  /// Drop every entry of `namespace`. Returns how many were dropped.
  pub fn clear_namespace(&self, namespace: Namespace) -> usize {
    let mut state = self.lock();
    let keys: Vec<EntryKey> = state
      .entries
      .keys()
      .filter(|key| key.namespace == namespace)
      .cloned()
      .collect();
    for key in &keys {
      state.remove(key);
    }
    keys.len()
  }

  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.total_bytes = 0;
  }

  /// Keys of entries that are expired at `now`.
  pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<EntryKey> {
    self
      .lock()
      .entries
      .iter()
      .filter(|(_, entry)| !entry.meta.is_valid_at(now))
      .map(|(key, _)| key.clone())
      .collect()
  }

  pub fn keys(&self) -> Vec<EntryKey> {
    self.lock().entries.keys().cloned().collect()
  }

  pub fn contains(&self, key: &EntryKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// Current `(bytes, entries)`.
  pub fn usage(&self) -> (usize, usize) {
    let state = self.lock();
    (state.total_bytes, state.entries.len())
  }
}
