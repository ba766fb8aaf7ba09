//! Error type for the cache surface.

use color_eyre::Report;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by cache operations.
///
/// Cloneable so one failed de-duplicated fetch can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// Offline and nothing cached for the requested key
  #[error("no cached data available while offline")]
  NoDataOffline,

  /// The caller-supplied fetch function failed
  #[error("fetch failed: {0}")]
  Fetch(Arc<Report>),

  /// A value could not be encoded for storage
  #[error("failed to serialize value for {key}: {message}")]
  Serialization { key: String, message: String },

  /// The persistent store rejected an operation
  #[error("persistent store error: {0}")]
  Store(Arc<Report>),

  /// A cached or in-flight value exists under this key with another type
  #[error("cached value for {key} has an unexpected type")]
  TypeMismatch { key: String },

  /// A key template needed a parameter the caller didn't supply
  #[error("key template '{template}' requires parameter '{param}'")]
  MissingKeyParam {
    template: &'static str,
    param: String,
  },
}

impl CacheError {
  pub(crate) fn fetch(report: Report) -> Self {
    Self::Fetch(Arc::new(report))
  }

  pub(crate) fn store(report: Report) -> Self {
    Self::Store(Arc::new(report))
  }

  /// Whether this error came from the remote fetch function.
  pub fn is_fetch(&self) -> bool {
    matches!(self, Self::Fetch(_))
  }
}
