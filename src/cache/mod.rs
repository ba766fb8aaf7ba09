//! Client-side cache for remote data.
//!
//! Two tiers sit behind [`CacheManager`]:
//! - a bounded in-memory tier with priority-then-LRU eviction
//! - a [`PersistentStore`] that survives restarts (SQLite by default)
//!
//! Entries carry a TTL and a [`Priority`] and live in a closed set of
//! [`Namespace`]s. On top of the manager:
//! - [`NetworkAwareFetcher`] picks cache or network based on connectivity
//! - [`CacheInvalidation`] maps domain events to the entries they make stale
//! - [`CachePreloader`] warms the cache once per session
//! - [`CacheAnalytics`] reports hit rates and recommendations

mod analytics;
mod clock;
mod error;
mod fetcher;
mod invalidation;
pub mod keys;
mod manager;
mod memory;
mod preload;
mod storage;
mod traits;

pub use analytics::{
  format_report, AnalyticsConfig, CacheAnalytics, HealthReport, HealthStatus, HealthSubscription,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CacheError;
pub use fetcher::{FetchOptions, NetworkAwareFetcher};
pub use invalidation::{
  default_rules, CacheInvalidation, InvalidationReport, InvalidationRule, RuleTarget, Subscription,
  Trigger,
};
pub use keys::{KeyParams, KeyTemplate};
pub use manager::{
  storage_key, CacheManager, CacheStats, EntrySummary, HitRate, Lookup, PruneReport, Tier,
};
pub use memory::{EntryMeta, MemoryLimits};
pub use preload::{CachePreloader, PreloadConfig, PreloadReport, PreloadSource, PreloadTask};
pub use storage::{NoopStore, PersistentStore, SqliteStore};
pub use traits::{
  CacheSource, Cacheable, EntryKey, FetchResult, Namespace, Priority, SetOptions, Ttl,
};
