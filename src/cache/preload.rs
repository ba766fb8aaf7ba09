//! Session-start warm-up of the data the first screens need.

use async_trait::async_trait;
use chrono::Duration;
use color_eyre::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys;
use super::manager::CacheManager;
use super::traits::{Namespace, Priority, SetOptions, Ttl};

/// Remote reads the preloader issues. Payloads are opaque to the cache.
#[async_trait]
pub trait PreloadSource: Send + Sync {
  async fn profile(&self, subject_id: &str) -> Result<Value>;

  async fn recent_receipts(&self, subject_id: &str, window_days: u32) -> Result<Value>;

  async fn shopping_lists(&self, subject_id: &str) -> Result<Value>;

  async fn subscription_status(&self, subject_id: &str) -> Result<Value>;

  /// The user's preferred locality, if they set one.
  async fn locality(&self, subject_id: &str) -> Result<Option<String>>;

  /// Price aggregate for a locality.
  async fn locality_prices(&self, locality: &str) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreloadTask {
  Profile,
  RecentReceipts,
  ShoppingLists,
  Subscription,
  LocalityPrices,
}

impl PreloadTask {
  fn set_options(&self) -> SetOptions {
    match self {
      Self::Profile => SetOptions::for_namespace(Namespace::UserPrefs)
        .with_ttl(Ttl::day())
        .with_priority(Priority::High),
      Self::RecentReceipts => SetOptions::for_namespace(Namespace::Receipts)
        .with_ttl(Ttl::medium())
        .with_priority(Priority::High),
      Self::ShoppingLists => SetOptions::for_namespace(Namespace::ShoppingList)
        .with_ttl(Ttl::medium())
        .with_priority(Priority::Normal),
      // Gates paid features; never evicted while anything else can go
      Self::Subscription => SetOptions::for_namespace(Namespace::UserPrefs)
        .with_ttl(Duration::hours(6))
        .with_priority(Priority::Critical),
      Self::LocalityPrices => SetOptions::for_namespace(Namespace::Prices)
        .with_ttl(Ttl::long())
        .with_priority(Priority::Normal),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadConfig {
  pub recent_window_days: u32,
  /// Re-fetch locality prices this often after a preload
  pub locality_refresh: Option<std::time::Duration>,
}

impl Default for PreloadConfig {
  fn default() -> Self {
    Self {
      recent_window_days: 30,
      locality_refresh: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
  pub subject_id: String,
  pub succeeded: Vec<PreloadTask>,
  pub failed: Vec<PreloadTask>,
  /// Not attempted, or finished after a reset and discarded
  pub skipped: Vec<PreloadTask>,
}

enum Outcome {
  Succeeded,
  Failed,
  Skipped,
}

/// Runs the warm-up reads at most once per session.
pub struct CachePreloader {
  cache: CacheManager,
  source: Arc<dyn PreloadSource>,
  config: PreloadConfig,
  started: AtomicBool,
  /// Bumped by `reset`; results from an older generation are dropped
  generation: Arc<AtomicU64>,
  jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl CachePreloader {
  pub fn new(cache: CacheManager, source: Arc<dyn PreloadSource>, config: PreloadConfig) -> Self {
    Self {
      cache,
      source,
      config,
      started: AtomicBool::new(false),
      generation: Arc::new(AtomicU64::new(0)),
      jobs: Mutex::new(Vec::new()),
    }
  }

  pub fn has_started(&self) -> bool {
    self.started.load(Ordering::Acquire)
  }

  /// Warm the cache for `subject_id`.
  ///
  /// Only the first call per session does anything; concurrent or later
  /// calls return `None` straight away. Reads run concurrently and fail
  /// independently.
  pub async fn preload_critical_data(&self, subject_id: &str) -> Option<PreloadReport> {
    if self
      .started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!(subject = subject_id, "preload already started this session");
      return None;
    }

    let generation = self.generation.load(Ordering::Acquire);
    info!(subject = subject_id, "preloading critical data");

    let source = &self.source;
    let (profile, recent, lists, subscription, locality) = tokio::join!(
      self.run(
        PreloadTask::Profile,
        generation,
        keys::PROFILE.for_subject(subject_id),
        source.profile(subject_id),
      ),
      self.run(
        PreloadTask::RecentReceipts,
        generation,
        keys::RECENT_RECEIPTS.for_subject(subject_id),
        source.recent_receipts(subject_id, self.config.recent_window_days),
      ),
      self.run(
        PreloadTask::ShoppingLists,
        generation,
        keys::SHOPPING_LISTS.for_subject(subject_id),
        source.shopping_lists(subject_id),
      ),
      self.run(
        PreloadTask::Subscription,
        generation,
        keys::SUBSCRIPTION.for_subject(subject_id),
        source.subscription_status(subject_id),
      ),
      self.preload_locality(subject_id, generation),
    );

    let mut report = PreloadReport {
      subject_id: subject_id.to_string(),
      ..Default::default()
    };
    for (task, outcome) in [
      (PreloadTask::Profile, profile),
      (PreloadTask::RecentReceipts, recent),
      (PreloadTask::ShoppingLists, lists),
      (PreloadTask::Subscription, subscription),
      (PreloadTask::LocalityPrices, locality),
    ] {
      match outcome {
        Outcome::Succeeded => report.succeeded.push(task),
        Outcome::Failed => report.failed.push(task),
        Outcome::Skipped => report.skipped.push(task),
      }
    }

    info!(
      subject = subject_id,
      succeeded = report.succeeded.len(),
      failed = report.failed.len(),
      "preload finished"
    );
    Some(report)
  }

  async fn run<Fut>(&self, task: PreloadTask, generation: u64, key: String, read: Fut) -> Outcome
  where
    Fut: Future<Output = Result<Value>>,
  {
    let value = match read.await {
      Ok(value) => value,
      Err(e) => {
        warn!(task = ?task, error = %e, "preload task failed");
        return Outcome::Failed;
      }
    };

    if self.generation.load(Ordering::Acquire) != generation {
      debug!(task = ?task, "discarding preload result after reset");
      return Outcome::Skipped;
    }

    match self.cache.set(&key, &value, task.set_options()).await {
      Ok(()) => Outcome::Succeeded,
      Err(e) => {
        warn!(task = ?task, error = %e, "failed to cache preloaded value");
        Outcome::Failed
      }
    }
  }

  async fn preload_locality(&self, subject_id: &str, generation: u64) -> Outcome {
    let locality = match self.source.locality(subject_id).await {
      Ok(Some(locality)) => locality,
      Ok(None) => {
        debug!(subject = subject_id, "no locality preference, skipping prices");
        return Outcome::Skipped;
      }
      Err(e) => {
        warn!(subject = subject_id, error = %e, "failed to read locality preference");
        return Outcome::Failed;
      }
    };

    let outcome = self
      .run(
        PreloadTask::LocalityPrices,
        generation,
        locality_key(&locality),
        self.source.locality_prices(&locality),
      )
      .await;

    if matches!(outcome, Outcome::Succeeded) {
      self.start_locality_refresh(locality, generation);
    }
    outcome
  }

  fn start_locality_refresh(&self, locality: String, generation: u64) {
    let Some(every) = self.config.locality_refresh else {
      return;
    };

    let cache = self.cache.clone();
    let source = Arc::clone(&self.source);
    let current = Arc::clone(&self.generation);

    let handle = tokio::spawn(async move {
      let key = locality_key(&locality);
      let options = PreloadTask::LocalityPrices.set_options();
      let mut interval = tokio::time::interval(every);
      // First tick is immediate and the preload just fetched
      interval.tick().await;

      loop {
        interval.tick().await;
        if current.load(Ordering::Acquire) != generation {
          break;
        }
        match source.locality_prices(&locality).await {
          Ok(prices) => {
            if let Err(e) = cache.set(&key, &prices, options).await {
              warn!(locality = %locality, error = %e, "failed to cache locality prices");
            }
          }
          Err(e) => warn!(locality = %locality, error = %e, "locality price refresh failed"),
        }
      }
    });

    self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(handle);
  }

  /// Forget that a preload ran and stop background jobs, so the next login
  /// preloads again. Reads still in flight finish but their results are
  /// discarded.
  pub fn reset(&self) {
    self.generation.fetch_add(1, Ordering::AcqRel);
    let jobs: Vec<JoinHandle<()>> = self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .drain(..)
      .collect();
    for job in &jobs {
      job.abort();
    }
    self.started.store(false, Ordering::Release);
    info!(stopped_jobs = jobs.len(), "preloader reset");
  }
}

fn locality_key(locality: &str) -> String {
  keys::LOCALITY_PRICES.fill(keys::PARAM_LOCALITY, locality)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::manager::tests::sqlite_cache;
  use crate::cache::memory::MemoryLimits;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct Calls {
    profile: AtomicUsize,
    recent: AtomicUsize,
    lists: AtomicUsize,
    subscription: AtomicUsize,
    locality: AtomicUsize,
    prices: AtomicUsize,
  }

  impl Calls {
    fn bump(counter: &AtomicUsize) {
      counter.fetch_add(1, Ordering::SeqCst);
    }

    fn get(counter: &AtomicUsize) -> usize {
      counter.load(Ordering::SeqCst)
    }
  }

  #[derive(Default)]
  struct FakeSource {
    calls: Calls,
    locality: Option<String>,
    fail_profile: bool,
    delay: Option<std::time::Duration>,
  }

  impl FakeSource {
    async fn pause(&self) {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
    }
  }

  #[async_trait]
  impl PreloadSource for FakeSource {
    async fn profile(&self, subject_id: &str) -> Result<Value> {
      Calls::bump(&self.calls.profile);
      self.pause().await;
      if self.fail_profile {
        return Err(eyre!("profile service down"));
      }
      Ok(json!({ "id": subject_id }))
    }

    async fn recent_receipts(&self, _subject_id: &str, window_days: u32) -> Result<Value> {
      Calls::bump(&self.calls.recent);
      self.pause().await;
      Ok(json!({ "window": window_days, "receipts": [] }))
    }

    async fn shopping_lists(&self, _subject_id: &str) -> Result<Value> {
      Calls::bump(&self.calls.lists);
      self.pause().await;
      Ok(json!([]))
    }

    async fn subscription_status(&self, _subject_id: &str) -> Result<Value> {
      Calls::bump(&self.calls.subscription);
      self.pause().await;
      Ok(json!({ "tier": "free" }))
    }

    async fn locality(&self, _subject_id: &str) -> Result<Option<String>> {
      Calls::bump(&self.calls.locality);
      Ok(self.locality.clone())
    }

    async fn locality_prices(&self, locality: &str) -> Result<Value> {
      Calls::bump(&self.calls.prices);
      Ok(json!({ "locality": locality }))
    }
  }

  fn preloader(
    source: FakeSource,
    config: PreloadConfig,
  ) -> (CachePreloader, CacheManager, Arc<FakeSource>) {
    let (cache, _) = sqlite_cache(MemoryLimits::default());
    let source = Arc::new(source);
    let preloader = CachePreloader::new(cache.clone(), source.clone(), config);
    (preloader, cache, source)
  }

  #[tokio::test]
  async fn test_preload_populates_cache() {
    let (preloader, cache, _) = preloader(
      FakeSource {
        locality: Some("lyon".to_string()),
        ..Default::default()
      },
      PreloadConfig::default(),
    );

    let report = preloader.preload_critical_data("u1").await.unwrap();
    assert_eq!(report.succeeded.len(), 5);
    assert!(report.failed.is_empty());

    let profile: Value = cache.get("profile:u1", Namespace::UserPrefs).await.unwrap();
    assert_eq!(profile["id"], "u1");
    assert!(cache.has("recent:u1", Namespace::Receipts).await);
    assert!(cache.has("lists:u1", Namespace::ShoppingList).await);
    assert!(cache.has("locality:lyon", Namespace::Prices).await);

    let subscription = cache
      .get_metadata("subscription:u1", Namespace::UserPrefs)
      .await
      .unwrap();
    assert_eq!(subscription.priority, Priority::Critical);
  }

  #[tokio::test]
  async fn test_concurrent_preloads_issue_reads_once() {
    let (preloader, _, source) = preloader(
      FakeSource {
        delay: Some(std::time::Duration::from_millis(10)),
        ..Default::default()
      },
      PreloadConfig::default(),
    );

    let (a, b) = tokio::join!(
      preloader.preload_critical_data("u1"),
      preloader.preload_critical_data("u1"),
    );

    assert!(a.is_some() != b.is_some());
    assert_eq!(Calls::get(&source.calls.profile), 1);
    assert_eq!(Calls::get(&source.calls.recent), 1);
    assert_eq!(Calls::get(&source.calls.lists), 1);
    assert_eq!(Calls::get(&source.calls.subscription), 1);
    assert_eq!(Calls::get(&source.calls.locality), 1);

    assert!(preloader.preload_critical_data("u1").await.is_none());
    assert_eq!(Calls::get(&source.calls.profile), 1);
  }

  #[tokio::test]
  async fn test_failed_task_is_isolated() {
    let (preloader, cache, _) = preloader(
      FakeSource {
        fail_profile: true,
        ..Default::default()
      },
      PreloadConfig::default(),
    );

    let report = preloader.preload_critical_data("u1").await.unwrap();

    assert_eq!(report.failed, vec![PreloadTask::Profile]);
    assert_eq!(report.skipped, vec![PreloadTask::LocalityPrices]);
    assert_eq!(report.succeeded.len(), 3);
    assert!(!cache.has("profile:u1", Namespace::UserPrefs).await);
    assert!(cache.has("recent:u1", Namespace::Receipts).await);
  }

  #[tokio::test]
  async fn test_unknown_locality_skips_prices() {
    let (preloader, _, source) = preloader(FakeSource::default(), PreloadConfig::default());

    preloader.preload_critical_data("u1").await.unwrap();

    assert_eq!(Calls::get(&source.calls.locality), 1);
    assert_eq!(Calls::get(&source.calls.prices), 0);
  }

  #[tokio::test]
  async fn test_reset_allows_another_preload() {
    let (preloader, _, source) = preloader(FakeSource::default(), PreloadConfig::default());

    preloader.preload_critical_data("u1").await.unwrap();
    preloader.reset();
    assert!(!preloader.has_started());
    preloader.preload_critical_data("u2").await.unwrap();

    assert_eq!(Calls::get(&source.calls.profile), 2);
  }

  #[tokio::test]
  async fn test_results_after_reset_are_discarded() {
    let (preloader, cache, _) = preloader(
      FakeSource {
        delay: Some(std::time::Duration::from_millis(50)),
        ..Default::default()
      },
      PreloadConfig::default(),
    );
    let preloader = Arc::new(preloader);

    let running = {
      let preloader = preloader.clone();
      tokio::spawn(async move { preloader.preload_critical_data("u1").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    preloader.reset();

    let report = running.await.unwrap().unwrap();
    assert!(report.succeeded.is_empty());
    assert!(!cache.has("recent:u1", Namespace::Receipts).await);
  }

  #[tokio::test(start_paused = true)]
  async fn test_locality_refresh_runs_until_reset() {
    let (preloader, _, source) = preloader(
      FakeSource {
        locality: Some("lyon".to_string()),
        ..Default::default()
      },
      PreloadConfig {
        locality_refresh: Some(std::time::Duration::from_secs(3600)),
        ..Default::default()
      },
    );

    preloader.preload_critical_data("u1").await.unwrap();
    assert_eq!(Calls::get(&source.calls.prices), 1);

    tokio::time::sleep(std::time::Duration::from_secs(3601)).await;
    assert_eq!(Calls::get(&source.calls.prices), 2);

    preloader.reset();
    tokio::time::sleep(std::time::Duration::from_secs(7300)).await;
    assert_eq!(Calls::get(&source.calls.prices), 2);
  }
}
