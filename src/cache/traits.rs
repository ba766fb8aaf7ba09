//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CacheError;

/// Bound for values that can be cached.
///
/// Values live deserialized in the memory tier and as JSON in the
/// persistent store, so they must be cloneable and round-trip through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Logical partition of cache keys.
///
/// The set is closed: clearing one namespace never touches another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
  Receipts,
  Items,
  UserPrefs,
  ShoppingList,
  HomeData,
  Stats,
  History,
  /// Locality-scoped price aggregates, shared by every user in an area
  Prices,
}

impl Namespace {
  pub const ALL: [Namespace; 8] = [
    Namespace::Receipts,
    Namespace::Items,
    Namespace::UserPrefs,
    Namespace::ShoppingList,
    Namespace::HomeData,
    Namespace::Stats,
    Namespace::History,
    Namespace::Prices,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Receipts => "receipts",
      Self::Items => "items",
      Self::UserPrefs => "user-prefs",
      Self::ShoppingList => "shopping-list",
      Self::HomeData => "home-data",
      Self::Stats => "stats",
      Self::History => "history",
      Self::Prices => "prices",
    }
  }

  /// Namespaces holding data that belongs to the signed-in user.
  pub fn is_user_scoped(&self) -> bool {
    !matches!(self, Self::Prices)
  }

  pub fn user_scoped() -> impl Iterator<Item = Namespace> {
    Self::ALL.into_iter().filter(Namespace::is_user_scoped)
  }

  /// TTL used when a caller doesn't pick one.
  pub fn default_ttl(&self) -> Duration {
    match self {
      Self::Receipts | Self::History => Ttl::medium(),
      Self::Items | Self::Prices => Ttl::long(),
      Self::UserPrefs => Ttl::day(),
      Self::ShoppingList => Ttl::medium(),
      Self::HomeData | Self::Stats => Ttl::short(),
    }
  }

  pub fn default_priority(&self) -> Priority {
    match self {
      Self::UserPrefs => Priority::High,
      Self::HomeData | Self::Receipts => Priority::Normal,
      Self::History | Self::Prices => Priority::Low,
      Self::Items | Self::ShoppingList | Self::Stats => Priority::Normal,
    }
  }
}

impl fmt::Display for Namespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Namespace {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|ns| ns.as_str() == s)
      .ok_or_else(|| format!("unknown namespace '{}'", s))
  }
}

/// Eviction weight. Lower priorities are evicted first.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

/// TTL presets.
pub struct Ttl;

impl Ttl {
  pub fn short() -> Duration {
    Duration::minutes(5)
  }

  pub fn medium() -> Duration {
    Duration::minutes(30)
  }

  pub fn long() -> Duration {
    Duration::hours(2)
  }

  pub fn day() -> Duration {
    Duration::hours(24)
  }

  pub fn week() -> Duration {
    Duration::days(7)
  }
}

/// A `(namespace, key)` pair, unique across both tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
  pub namespace: Namespace,
  pub key: String,
}

impl EntryKey {
  pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
    Self {
      namespace,
      key: key.into(),
    }
  }
}

impl fmt::Display for EntryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.namespace, self.key)
  }
}

/// Write options for [`CacheManager::set`](super::CacheManager::set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
  pub namespace: Namespace,
  pub ttl: Duration,
  pub priority: Priority,
}

impl SetOptions {
  /// Options using the namespace's default TTL and priority.
  pub fn for_namespace(namespace: Namespace) -> Self {
    Self {
      namespace,
      ttl: namespace.default_ttl(),
      priority: namespace.default_priority(),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }
}

/// Result from a cache-aware fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Fetch failure that was recovered from by serving cached data
  pub error: Option<CacheError>,
}

impl<T> FetchResult<T> {
  /// Create a new result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      error: None,
    }
  }

  /// Create a new result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Create a new result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Attach the fetch error that caused a fallback to cached data.
  pub fn with_error(mut self, error: CacheError) -> Self {
    self.error = Some(error);
    self
  }

  pub fn is_cached(&self) -> bool {
    !matches!(self.source, CacheSource::Network)
  }

  pub fn is_stale(&self) -> bool {
    matches!(self.source, CacheSource::CacheStale | CacheSource::Offline)
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, expired or served after a failed fetch
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_namespace_round_trips_through_str() {
    for ns in Namespace::ALL {
      assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
    }
    assert!("nope".parse::<Namespace>().is_err());
  }

  #[test]
  fn test_prices_is_not_user_scoped() {
    let scoped: Vec<_> = Namespace::user_scoped().collect();
    assert_eq!(scoped.len(), Namespace::ALL.len() - 1);
    assert!(!scoped.contains(&Namespace::Prices));
  }

  #[test]
  fn test_priority_order() {
    assert!(Priority::Low < Priority::Normal);
    assert!(Priority::Normal < Priority::High);
    assert!(Priority::High < Priority::Critical);
  }

  #[test]
  fn test_fetch_result_flags() {
    let now = Utc::now();
    assert!(!FetchResult::from_network(1).is_cached());
    assert!(!FetchResult::from_cache(1, now, false).is_stale());
    assert!(FetchResult::from_cache(1, now, true).is_stale());
    let offline = FetchResult::offline(1, now);
    assert!(offline.is_cached());
    assert!(offline.is_stale());
  }
}
