//! Maps domain events to the cache entries they make inaccurate.
//!
//! Two sources decide what a trigger removes:
//! - a static rule table (exact keys, key templates filled from caller
//!   parameters, whole namespaces)
//! - a dependency graph of keys registered at write time with [`CacheInvalidation::track`],
//!   so dynamically named keys are covered without listing them in the table

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::keys::{self, KeyParams, KeyTemplate};
use super::manager::CacheManager;
use super::traits::{EntryKey, Namespace};

/// Domain event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
  RecordCreated,
  RecordUpdated,
  RecordDeleted,
  ListChanged,
  ItemUpdated,
  ProfileUpdated,
  BudgetUpdated,
  SubscriptionChanged,
  /// Logout: drops every user-scoped namespace
  SessionEnded,
}

impl Trigger {
  pub const ALL: [Trigger; 9] = [
    Trigger::RecordCreated,
    Trigger::RecordUpdated,
    Trigger::RecordDeleted,
    Trigger::ListChanged,
    Trigger::ItemUpdated,
    Trigger::ProfileUpdated,
    Trigger::BudgetUpdated,
    Trigger::SubscriptionChanged,
    Trigger::SessionEnded,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::RecordCreated => "record-created",
      Self::RecordUpdated => "record-updated",
      Self::RecordDeleted => "record-deleted",
      Self::ListChanged => "list-changed",
      Self::ItemUpdated => "item-updated",
      Self::ProfileUpdated => "profile-updated",
      Self::BudgetUpdated => "budget-updated",
      Self::SubscriptionChanged => "subscription-changed",
      Self::SessionEnded => "session-ended",
    }
  }
}

impl fmt::Display for Trigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Trigger {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|trigger| trigger.as_str() == s)
      .ok_or_else(|| format!("unknown trigger '{}'", s))
  }
}

/// What a rule removes within its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
  /// One fixed key
  Key(String),
  /// One key rebuilt from the caller's parameters
  Template(KeyTemplate),
  /// Everything in the namespace
  WholeNamespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRule {
  pub namespace: Namespace,
  pub target: RuleTarget,
}

impl InvalidationRule {
  pub fn key(namespace: Namespace, key: impl Into<String>) -> Self {
    Self {
      namespace,
      target: RuleTarget::Key(key.into()),
    }
  }

  pub fn template(namespace: Namespace, template: KeyTemplate) -> Self {
    Self {
      namespace,
      target: RuleTarget::Template(template),
    }
  }

  pub fn namespace(namespace: Namespace) -> Self {
    Self {
      namespace,
      target: RuleTarget::WholeNamespace,
    }
  }
}

/// Rules shared by every receipt mutation.
fn record_rules() -> Vec<InvalidationRule> {
  vec![
    InvalidationRule::template(Namespace::Receipts, keys::RECENT_RECEIPTS),
    InvalidationRule::template(Namespace::Stats, keys::RECEIPT_STATS),
    InvalidationRule::template(Namespace::HomeData, keys::HOME_DATA),
    InvalidationRule::namespace(Namespace::History),
  ]
}

/// The built-in trigger table.
pub fn default_rules() -> HashMap<Trigger, Vec<InvalidationRule>> {
  Trigger::ALL
    .into_iter()
    .map(|trigger| {
      let rules = match trigger {
        Trigger::RecordCreated => record_rules(),
        Trigger::RecordUpdated | Trigger::RecordDeleted => {
          let mut rules = record_rules();
          rules.push(InvalidationRule::template(Namespace::Receipts, keys::RECEIPT));
          rules
        }
        Trigger::ListChanged => vec![
          InvalidationRule::template(Namespace::ShoppingList, keys::SHOPPING_LISTS),
          InvalidationRule::template(Namespace::ShoppingList, keys::SHOPPING_LIST),
          InvalidationRule::template(Namespace::HomeData, keys::HOME_DATA),
        ],
        Trigger::ItemUpdated => vec![
          InvalidationRule::namespace(Namespace::Items),
          InvalidationRule::namespace(Namespace::Prices),
        ],
        Trigger::ProfileUpdated => vec![
          InvalidationRule::template(Namespace::UserPrefs, keys::PROFILE),
          InvalidationRule::template(Namespace::HomeData, keys::HOME_DATA),
        ],
        Trigger::BudgetUpdated => vec![
          InvalidationRule::template(Namespace::UserPrefs, keys::BUDGET),
          InvalidationRule::template(Namespace::Stats, keys::RECEIPT_STATS),
          InvalidationRule::template(Namespace::HomeData, keys::HOME_DATA),
        ],
        Trigger::SubscriptionChanged => vec![InvalidationRule::template(
          Namespace::UserPrefs,
          keys::SUBSCRIPTION,
        )],
        Trigger::SessionEnded => Namespace::user_scoped()
          .map(InvalidationRule::namespace)
          .collect(),
      };
      (trigger, rules)
    })
    .collect()
}

/// Outcome of one [`CacheInvalidation::invalidate`] call, also handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
  pub trigger: Trigger,
  pub params: KeyParams,
  /// Rules and tracked keys applied successfully
  pub applied: usize,
  /// Rules and tracked keys that failed (logged)
  pub failed: usize,
}

type Listener = Arc<dyn Fn(&InvalidationReport) + Send + Sync>;

/// Handle returned by [`CacheInvalidation::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
  id: u64,
}

struct ListenerSlot {
  id: u64,
  trigger: Trigger,
  listener: Listener,
}

pub struct CacheInvalidation {
  cache: CacheManager,
  rules: HashMap<Trigger, Vec<InvalidationRule>>,
  dependencies: Mutex<HashMap<Trigger, BTreeSet<EntryKey>>>,
  listeners: Mutex<Vec<ListenerSlot>>,
  next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CacheInvalidation {
  /// Invalidation over the built-in rule table.
  pub fn new(cache: CacheManager) -> Self {
    Self::with_rules(cache, default_rules())
  }

  pub fn with_rules(cache: CacheManager, rules: HashMap<Trigger, Vec<InvalidationRule>>) -> Self {
    Self {
      cache,
      rules,
      dependencies: Mutex::new(HashMap::new()),
      listeners: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn rules(&self, trigger: Trigger) -> &[InvalidationRule] {
    self.rules.get(&trigger).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Register `(namespace, key)` as depending on `trigger`.
  ///
  /// The next `invalidate(trigger, ..)` removes it, then forgets the edge.
  pub fn track(&self, trigger: Trigger, namespace: Namespace, key: impl Into<String>) {
    lock(&self.dependencies)
      .entry(trigger)
      .or_default()
      .insert(EntryKey::new(namespace, key));
  }

  /// Keys currently tracked for `trigger`.
  pub fn tracked(&self, trigger: Trigger) -> Vec<EntryKey> {
    lock(&self.dependencies)
      .get(&trigger)
      .map(|keys| keys.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Call `listener` after every invalidation of `trigger`.
  pub fn subscribe<F>(&self, trigger: Trigger, listener: F) -> Subscription
  where
    F: Fn(&InvalidationReport) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.listeners).push(ListenerSlot {
      id,
      trigger,
      listener: Arc::new(listener),
    });
    Subscription { id }
  }

  /// Returns false if the subscription was already gone.
  pub fn unsubscribe(&self, subscription: Subscription) -> bool {
    let mut listeners = lock(&self.listeners);
    let before = listeners.len();
    listeners.retain(|slot| slot.id != subscription.id);
    listeners.len() != before
  }

  /// Apply every rule and tracked dependency for `trigger`, then notify
  /// listeners in registration order.
  ///
  /// A failing rule is logged and doesn't stop the rest; a panicking
  /// listener is logged and doesn't stop the other listeners.
  pub async fn invalidate(&self, trigger: Trigger, params: &KeyParams) -> InvalidationReport {
    let mut report = InvalidationReport {
      trigger,
      params: params.clone(),
      applied: 0,
      failed: 0,
    };

    for rule in self.rules(trigger) {
      match self.apply(rule, params).await {
        Ok(()) => report.applied += 1,
        Err(e) => {
          report.failed += 1;
          warn!(
            trigger = %trigger,
            namespace = %rule.namespace,
            error = %e,
            "invalidation rule failed"
          );
        }
      }
    }

    let tracked = {
      let mut dependencies = lock(&self.dependencies);
      if trigger == Trigger::SessionEnded {
        // User-scoped namespaces are gone; keep edges into shared data only
        dependencies
          .values_mut()
          .for_each(|keys| keys.retain(|key| !key.namespace.is_user_scoped()));
      }
      dependencies.remove(&trigger).unwrap_or_default()
    };

    for key in tracked {
      match self.cache.remove(&key.key, key.namespace).await {
        Ok(()) => report.applied += 1,
        Err(e) => {
          report.failed += 1;
          warn!(trigger = %trigger, key = %key, error = %e, "failed to drop tracked key");
        }
      }
    }

    info!(
      trigger = %trigger,
      applied = report.applied,
      failed = report.failed,
      "cache invalidated"
    );

    self.notify(&report);
    report
  }

  async fn apply(&self, rule: &InvalidationRule, params: &KeyParams) -> Result<(), CacheError> {
    match &rule.target {
      RuleTarget::Key(key) => self.cache.remove(key, rule.namespace).await,
      RuleTarget::Template(template) => {
        let key = template.render(params)?;
        debug!(namespace = %rule.namespace, key = %key, "invalidating key");
        self.cache.remove(&key, rule.namespace).await
      }
      RuleTarget::WholeNamespace => self.cache.clear_namespace(rule.namespace).await,
    }
  }

  fn notify(&self, report: &InvalidationReport) {
    // Snapshot so listeners may subscribe/unsubscribe while being called
    let listeners: Vec<Listener> = lock(&self.listeners)
      .iter()
      .filter(|slot| slot.trigger == report.trigger)
      .map(|slot| Arc::clone(&slot.listener))
      .collect();

    for listener in listeners {
      if catch_unwind(AssertUnwindSafe(|| listener(report))).is_err() {
        warn!(trigger = %report.trigger, "invalidation listener panicked");
      }
    }
  }
}
