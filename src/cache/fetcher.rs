//! Connectivity-aware fetch strategies on top of the cache manager.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::CacheError;
use super::manager::{CacheManager, Lookup};
use super::traits::{Cacheable, FetchResult, SetOptions};
use crate::connectivity::{ConnectionQuality, ConnectivityProvider};

/// Options for [`NetworkAwareFetcher::fetch_with_cache`].
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
  pub set: SetOptions,
  /// Always hit the network when online
  pub force_refresh: bool,
}

impl FetchOptions {
  pub fn new(set: SetOptions) -> Self {
    Self {
      set,
      force_refresh: false,
    }
  }

  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }
}

impl From<SetOptions> for FetchOptions {
  fn from(set: SetOptions) -> Self {
    Self::new(set)
  }
}

fn cached_result<T>(lookup: Lookup<T>, is_stale: bool) -> FetchResult<T> {
  FetchResult::from_cache(lookup.value, lookup.meta.created_at, is_stale)
}

/// Wraps "compute a fresh value" functions with a policy chosen per call
/// from the current connectivity.
pub struct NetworkAwareFetcher {
  cache: CacheManager,
  connectivity: Arc<dyn ConnectivityProvider>,
}

impl NetworkAwareFetcher {
  pub fn new(cache: CacheManager, connectivity: Arc<dyn ConnectivityProvider>) -> Self {
    Self {
      cache,
      connectivity,
    }
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  /// Fetch with the connectivity-dependent strategy.
  ///
  /// 1. Offline: serve the cached value (always marked stale) or fail with
  ///    [`CacheError::NoDataOffline`]
  /// 2. Forced refresh: fetch, falling back to the cached value on failure
  /// 3. Poor link with a cached value: serve it, even if expired, as not
  ///    stale and refresh in the background
  /// 4. Otherwise: serve a valid cached value, or fetch and cache; a failed
  ///    fetch falls back to an expired value with the error attached
  pub async fn fetch_with_cache<T, F, Fut>(
    &self,
    key: &str,
    options: impl Into<FetchOptions>,
    fetcher: F,
  ) -> Result<FetchResult<T>, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let options = options.into();
    let namespace = options.set.namespace;
    let status = self.connectivity.current().await;
    let cached = self.cache.lookup::<T>(key, namespace).await;

    if !status.is_connected {
      return match cached {
        Some(lookup) => {
          debug!(namespace = %namespace, key, "offline, serving cached value");
          Ok(FetchResult::offline(lookup.value, lookup.meta.created_at))
        }
        None => Err(CacheError::NoDataOffline),
      };
    }

    if options.force_refresh {
      return self.fetch_fresh(key, options.set, fetcher, cached).await;
    }

    match (status.quality(), cached) {
      (ConnectionQuality::Poor, Some(lookup)) => {
        debug!(namespace = %namespace, key, "poor connection, refreshing in background");
        self.cache.spawn_refresh::<T, _, _>(key, options.set, fetcher);
        Ok(cached_result(lookup, false))
      }
      (_, Some(lookup)) if lookup.is_valid => Ok(cached_result(lookup, false)),
      (_, cached) => self.fetch_fresh(key, options.set, fetcher, cached).await,
    }
  }

  async fn fetch_fresh<T, F, Fut>(
    &self,
    key: &str,
    set: SetOptions,
    fetcher: F,
    cached: Option<Lookup<T>>,
  ) -> Result<FetchResult<T>, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    match self.cache.fetch_and_store(key, set, fetcher).await {
      Ok(data) => Ok(FetchResult::from_network(data)),
      Err(error) => match cached {
        Some(lookup) => {
          warn!(
            namespace = %set.namespace,
            key,
            error = %error,
            "fetch failed, serving cached value"
          );
          Ok(cached_result(lookup, true).with_error(error))
        }
        None => Err(error),
      },
    }
  }

  /// Return whatever is cached right away and, when online, refresh in the
  /// background, handing the fresh value to `on_update` once it arrives.
  ///
  /// Never waits on the network.
  pub async fn stale_while_revalidate<T, F, Fut, C>(
    &self,
    key: &str,
    set: SetOptions,
    fetcher: F,
    on_update: C,
  ) -> Option<FetchResult<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
    C: FnOnce(T) + Send + 'static,
  {
    let cached = self.cache.lookup::<T>(key, set.namespace).await;

    if self.connectivity.current().await.is_connected {
      let cache = self.cache.clone();
      let key = key.to_string();
      tokio::spawn(async move {
        match cache.fetch_and_store::<T, _, _>(&key, set, fetcher).await {
          Ok(fresh) => on_update(fresh),
          Err(e) => warn!(
            namespace = %set.namespace,
            key = %key,
            error = %e,
            "revalidation failed"
          ),
        }
      });
    }

    cached.map(|lookup| {
      let is_stale = !lookup.is_valid;
      cached_result(lookup, is_stale)
    })
  }

  /// Fetch and cache a value nobody is waiting for yet.
  ///
  /// No-op while offline; failures are logged, never returned.
  pub async fn prefetch<T, F, Fut>(&self, key: &str, set: SetOptions, fetcher: F)
  where
    T: Cacheable,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    if !self.connectivity.current().await.is_connected {
      debug!(namespace = %set.namespace, key, "offline, skipping prefetch");
      return;
    }

    if let Err(e) = self.cache.fetch_and_store::<T, _, _>(key, set, fetcher).await {
      warn!(namespace = %set.namespace, key, error = %e, "prefetch failed");
    }
  }
}

impl Clone for NetworkAwareFetcher {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      connectivity: Arc::clone(&self.connectivity),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::manager::tests::sqlite_cache;
  use crate::cache::memory::MemoryLimits;
  use crate::cache::traits::{CacheSource, Namespace};
  use crate::connectivity::{ConnectionType, NetworkStatus, WatchConnectivity};
  use chrono::Duration;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::oneshot;

  struct Harness {
    fetcher: NetworkAwareFetcher,
    cache: CacheManager,
    clock: Arc<ManualClock>,
    network: Arc<WatchConnectivity>,
    calls: Arc<AtomicUsize>,
  }

  impl Harness {
    fn new(status: NetworkStatus) -> Self {
      let (cache, clock) = sqlite_cache(MemoryLimits::default());
      let network = Arc::new(WatchConnectivity::new(status));
      let fetcher = NetworkAwareFetcher::new(cache.clone(), network.clone());
      Self {
        fetcher,
        cache,
        clock,
        network,
        calls: Arc::new(AtomicUsize::new(0)),
      }
    }

    /// Fetcher that counts calls and returns `value`.
    fn ok(
      &self,
      value: u32,
    ) -> impl FnOnce() -> futures::future::Ready<color_eyre::Result<u32>> + Send + 'static {
      let calls = self.calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(value))
      }
    }

    fn failing(
      &self,
    ) -> impl FnOnce() -> futures::future::Ready<color_eyre::Result<u32>> + Send + 'static {
      let calls = self.calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Err(eyre!("network error")))
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  fn set() -> SetOptions {
    SetOptions::for_namespace(Namespace::HomeData).with_ttl(Duration::minutes(5))
  }

  fn wifi() -> NetworkStatus {
    NetworkStatus::online(ConnectionType::Wifi)
  }

  #[tokio::test]
  async fn test_offline_serves_cache_without_fetching() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();
    h.network.set_status(NetworkStatus::offline());

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();

    assert_eq!(result.data, 1);
    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.is_stale());
    assert_eq!(h.calls(), 0);
  }

  #[tokio::test]
  async fn test_offline_serves_expired_cache() {
    let h = Harness::new(NetworkStatus::offline());
    h.cache.set("home", &1u32, set()).await.unwrap();
    h.clock.advance(Duration::hours(3));

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();
    assert_eq!(result.data, 1);
    assert!(result.is_stale());
  }

  #[tokio::test]
  async fn test_offline_without_cache_fails() {
    let h = Harness::new(NetworkStatus::offline());

    let err = h
      .fetcher
      .fetch_with_cache("home", set(), h.ok(2))
      .await
      .unwrap_err();

    assert!(matches!(err, CacheError::NoDataOffline));
    assert_eq!(h.calls(), 0);
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_fresh_cache() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();

    let result = h
      .fetcher
      .fetch_with_cache("home", FetchOptions::new(set()).force_refresh(), h.ok(2))
      .await
      .unwrap();

    assert_eq!(result.data, 2);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(h.calls(), 1);
    assert_eq!(h.cache.get::<u32>("home", Namespace::HomeData).await, Some(2));
  }

  #[tokio::test]
  async fn test_force_refresh_failure_falls_back_to_cache() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();

    let result = h
      .fetcher
      .fetch_with_cache("home", FetchOptions::new(set()).force_refresh(), h.failing())
      .await
      .unwrap();

    assert_eq!(result.data, 1);
    assert!(result.is_stale());
    assert!(result.error.as_ref().is_some_and(CacheError::is_fetch));
  }

  #[tokio::test]
  async fn test_force_refresh_failure_without_cache_propagates() {
    let h = Harness::new(wifi());

    let err = h
      .fetcher
      .fetch_with_cache("home", FetchOptions::new(set()).force_refresh(), h.failing())
      .await
      .unwrap_err();

    assert!(err.is_fetch());
  }

  #[tokio::test]
  async fn test_good_connection_serves_valid_cache() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();

    assert_eq!(result.data, 1);
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(h.calls(), 0);
  }

  #[tokio::test]
  async fn test_good_connection_fetches_on_miss() {
    let h = Harness::new(wifi());

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();

    assert_eq!(result.data, 2);
    assert!(!result.is_cached());
    assert_eq!(h.cache.get::<u32>("home", Namespace::HomeData).await, Some(2));
  }

  #[tokio::test]
  async fn test_good_connection_expired_cache_fetch_fails() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();
    h.clock.advance(Duration::minutes(6));

    let result = h
      .fetcher
      .fetch_with_cache("home", set(), h.failing())
      .await
      .unwrap();

    assert_eq!(result.data, 1);
    assert_eq!(result.source, CacheSource::CacheStale);
    assert!(result.error.is_some());
    assert_eq!(h.calls(), 1);
  }

  #[tokio::test]
  async fn test_poor_connection_serves_cache_and_refreshes() {
    let h = Harness::new(NetworkStatus::online(ConnectionType::Cellular2g));
    h.cache.set("home", &1u32, set()).await.unwrap();

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();
    assert_eq!(result.data, 1);
    assert!(!result.is_stale());

    let cache = h.cache.clone();
    tokio::time::timeout(std::time::Duration::from_secs(1), async move {
      while cache.get::<u32>("home", Namespace::HomeData).await != Some(2) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(h.calls(), 1);
  }

  #[tokio::test]
  async fn test_poor_connection_serves_expired_cache_as_current() {
    let h = Harness::new(NetworkStatus::online(ConnectionType::Cellular3g));
    h.cache.set("home", &1u32, set()).await.unwrap();
    h.clock.advance(Duration::minutes(6));

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(2)).await.unwrap();
    assert_eq!(result.data, 1);
    assert!(!result.is_stale());

    let cache = h.cache.clone();
    tokio::time::timeout(std::time::Duration::from_secs(1), async move {
      while cache.get::<u32>("home", Namespace::HomeData).await != Some(2) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn test_poor_connection_background_failure_is_swallowed() {
    let h = Harness::new(NetworkStatus::online(ConnectionType::Cellular3g));
    h.cache.set("home", &1u32, set()).await.unwrap();

    let result = h
      .fetcher
      .fetch_with_cache("home", set(), h.failing())
      .await
      .unwrap();
    assert_eq!(result.data, 1);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(h.calls(), 1);
    assert_eq!(h.cache.get::<u32>("home", Namespace::HomeData).await, Some(1));
  }

  #[tokio::test]
  async fn test_poor_connection_without_cache_fetches() {
    let h = Harness::new(NetworkStatus::online(ConnectionType::Cellular2g));

    let result = h.fetcher.fetch_with_cache("home", set(), h.ok(3)).await.unwrap();
    assert_eq!(result.data, 3);
    assert_eq!(result.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_returns_cache_then_updates() {
    let h = Harness::new(wifi());
    h.cache.set("home", &1u32, set()).await.unwrap();
    let (tx, rx) = oneshot::channel();

    let cached = h
      .fetcher
      .stale_while_revalidate("home", set(), h.ok(2), move |fresh| {
        let _ = tx.send(fresh);
      })
      .await;

    assert_eq!(cached.unwrap().data, 1);
    assert_eq!(rx.await.unwrap(), 2);
    assert_eq!(h.cache.get::<u32>("home", Namespace::HomeData).await, Some(2));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_without_cache() {
    let h = Harness::new(wifi());
    let (tx, rx) = oneshot::channel();

    let cached = h
      .fetcher
      .stale_while_revalidate("home", set(), h.ok(2), move |fresh| {
        let _ = tx.send(fresh);
      })
      .await;

    assert!(cached.is_none());
    assert_eq!(rx.await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_offline_does_not_fetch() {
    let h = Harness::new(NetworkStatus::offline());
    h.cache.set("home", &1u32, set()).await.unwrap();

    let cached = h
      .fetcher
      .stale_while_revalidate("home", set(), h.ok(2), |_| {})
      .await;

    assert_eq!(cached.unwrap().data, 1);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(h.calls(), 0);
  }

  #[tokio::test]
  async fn test_prefetch() {
    let h = Harness::new(NetworkStatus::offline());
    h.fetcher.prefetch("home", set(), h.ok(2)).await;
    assert_eq!(h.calls(), 0);

    h.network.set_status(wifi());
    h.fetcher.prefetch("home", set(), h.failing()).await;
    assert_eq!(h.calls(), 1);
    assert!(!h.cache.has("home", Namespace::HomeData).await);

    h.fetcher.prefetch("home", set(), h.ok(2)).await;
    assert_eq!(h.cache.get::<u32>("home", Namespace::HomeData).await, Some(2));
  }
}
