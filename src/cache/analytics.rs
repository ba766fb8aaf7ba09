//! Periodic health checks over the cache counters.
//!
//! Reports are advisory. Nothing here changes cache behavior.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::{CacheManager, CacheStats, HitRate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Poor,
  Fair,
  Good,
  Excellent,
}

impl HealthStatus {
  /// Classify an overall hit rate given in percent.
  pub fn from_hit_rate(overall: f64) -> Self {
    if overall >= 85.0 {
      Self::Excellent
    } else if overall >= 70.0 {
      Self::Good
    } else if overall >= 50.0 {
      Self::Fair
    } else {
      Self::Poor
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Poor => "poor",
      Self::Fair => "fair",
      Self::Good => "good",
      Self::Excellent => "excellent",
    }
  }
}

impl fmt::Display for HealthStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
  /// More errors than this forces `Poor`
  pub error_threshold: u64,
  /// Memory hit rate (percent) below which a recommendation is emitted
  pub memory_hit_rate_warning: f64,
  /// evictions / writes above this is flagged
  pub eviction_ratio_warning: f64,
  /// Fraction of the memory byte bound above which usage is flagged
  pub memory_pressure_warning: f64,
  pub history_len: usize,
}

impl Default for AnalyticsConfig {
  fn default() -> Self {
    Self {
      error_threshold: 10,
      memory_hit_rate_warning: 60.0,
      eviction_ratio_warning: 0.25,
      memory_pressure_warning: 0.9,
      history_len: 24,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
  pub timestamp: DateTime<Utc>,
  pub status: HealthStatus,
  pub hit_rate: HitRate,
  pub stats: CacheStats,
  pub recommendations: Vec<String>,
}

type Listener = Arc<dyn Fn(&HealthReport) + Send + Sync>;

/// Handle returned by [`CacheAnalytics::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSubscription {
  id: u64,
}

struct Inner {
  cache: CacheManager,
  config: AnalyticsConfig,
  listeners: Mutex<Vec<(u64, Listener)>>,
  history: Mutex<VecDeque<HealthReport>>,
  next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
  fn check_health(&self) -> HealthReport {
    let stats = self.cache.get_stats();
    let hit_rate = self.cache.get_hit_rate();

    let mut status = HealthStatus::from_hit_rate(hit_rate.overall);
    if stats.errors > self.config.error_threshold {
      status = HealthStatus::Poor;
    }

    let report = HealthReport {
      timestamp: self.cache.now(),
      status,
      hit_rate,
      recommendations: self.recommendations(&stats, &hit_rate),
      stats,
    };

    {
      let mut history = lock(&self.history);
      history.push_back(report.clone());
      while history.len() > self.config.history_len {
        history.pop_front();
      }
    }

    debug!(
      status = %report.status,
      hit_rate = report.hit_rate.overall,
      recommendations = report.recommendations.len(),
      "cache health checked"
    );
    self.notify(&report);
    report
  }

  fn recommendations(&self, stats: &CacheStats, hit_rate: &HitRate) -> Vec<String> {
    let mut out = Vec::new();
    let config = &self.config;

    let memory_attempts = stats.memory_hits + stats.memory_misses;
    if memory_attempts > 0 && hit_rate.memory < config.memory_hit_rate_warning {
      out.push(format!(
        "Memory hit rate is {:.1}%. Preload frequently read data or raise the memory entry limit.",
        hit_rate.memory
      ));
    }

    if stats.writes > 0 {
      let ratio = stats.evictions as f64 / stats.writes as f64;
      if ratio > config.eviction_ratio_warning {
        out.push(format!(
          "{} evictions for {} writes ({:.0}%). The memory tier is too small for the working set.",
          stats.evictions,
          stats.writes,
          ratio * 100.0
        ));
      }
    }

    let max_bytes = self.cache.memory_limits().max_bytes;
    if max_bytes > 0 {
      let usage = stats.memory_size_bytes as f64 / max_bytes as f64;
      if usage > config.memory_pressure_warning {
        out.push(format!(
          "Memory tier holds {} of {} bytes ({:.0}%). \
           Shorten TTLs or lower priorities of large entries.",
          stats.memory_size_bytes,
          max_bytes,
          usage * 100.0
        ));
      }
    }

    if stats.errors > config.error_threshold {
      out.push(format!(
        "{} cache errors recorded. Check the persistent store for corrupt entries.",
        stats.errors
      ));
    }

    out
  }

  fn notify(&self, report: &HealthReport) {
    let listeners: Vec<Listener> = lock(&self.listeners)
      .iter()
      .map(|(_, listener)| Arc::clone(listener))
      .collect();

    for listener in listeners {
      if catch_unwind(AssertUnwindSafe(|| listener(report))).is_err() {
        warn!("health listener panicked");
      }
    }
  }
}

/// Samples cache statistics on demand or on a timer.
pub struct CacheAnalytics {
  inner: Arc<Inner>,
  monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CacheAnalytics {
  pub fn new(cache: CacheManager, config: AnalyticsConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        config,
        listeners: Mutex::new(Vec::new()),
        history: Mutex::new(VecDeque::new()),
        next_id: AtomicU64::new(1),
      }),
      monitor: Mutex::new(None),
    }
  }

  /// Sample the counters, record the report and notify listeners.
  pub fn check_health(&self) -> HealthReport {
    self.inner.check_health()
  }

  /// Run [`check_health`](Self::check_health) every `interval_minutes`
  /// (at least one). Replaces any running monitor.
  pub fn start_monitoring(&self, interval_minutes: u64) {
    let every = std::time::Duration::from_secs(interval_minutes.max(1).saturating_mul(60));
    let inner = Arc::clone(&self.inner);

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.tick().await;
      loop {
        interval.tick().await;
        let report = inner.check_health();
        if report.status == HealthStatus::Poor {
          warn!(
            hit_rate = report.hit_rate.overall,
            errors = report.stats.errors,
            "cache health is poor"
          );
        }
      }
    });

    if let Some(previous) = lock(&self.monitor).replace(handle) {
      previous.abort();
    }
    info!(interval_minutes, "cache monitoring started");
  }

  pub fn stop_monitoring(&self) {
    if let Some(handle) = lock(&self.monitor).take() {
      handle.abort();
      info!("cache monitoring stopped");
    }
  }

  pub fn is_monitoring(&self) -> bool {
    lock(&self.monitor).is_some()
  }

  pub fn subscribe<F>(&self, listener: F) -> HealthSubscription
  where
    F: Fn(&HealthReport) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.inner.listeners).push((id, Arc::new(listener)));
    HealthSubscription { id }
  }

  pub fn unsubscribe(&self, subscription: HealthSubscription) -> bool {
    let mut listeners = lock(&self.inner.listeners);
    let before = listeners.len();
    listeners.retain(|(id, _)| *id != subscription.id);
    listeners.len() != before
  }

  /// Recent reports, oldest first.
  pub fn history(&self) -> Vec<HealthReport> {
    lock(&self.inner.history).iter().cloned().collect()
  }
}

impl Drop for CacheAnalytics {
  fn drop(&mut self) {
    if let Some(handle) = lock(&self.monitor).take() {
      handle.abort();
    }
  }
}

/// Human-readable rendering of a report.
pub fn format_report(report: &HealthReport) -> String {
  let stats = &report.stats;
  let mut out = format!(
    "Cache health: {} ({})\n\
     Hit rate: {:.1}% overall, {:.1}% memory, {:.1}% disk\n\
     Memory: {} entries, {} bytes\n\
     Writes: {}, evictions: {}, errors: {}\n",
    report.status,
    report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    report.hit_rate.overall,
    report.hit_rate.memory,
    report.hit_rate.disk,
    stats.memory_entry_count,
    stats.memory_size_bytes,
    stats.writes,
    stats.evictions,
    stats.errors,
  );

  if report.recommendations.is_empty() {
    out.push_str("No recommendations.\n");
  } else {
    out.push_str("Recommendations:\n");
    for rec in &report.recommendations {
      out.push_str("  - ");
      out.push_str(rec);
      out.push('\n');
    }
  }
  out
}
