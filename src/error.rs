use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The error type loaders and expiry calculators may return.
pub type LoadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error indicating an invalid cache configuration at build time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("entry capacity cannot be zero; use unbounded() to disable the bound")]
  ZeroCapacity,
  #[error("shard count cannot be zero")]
  ZeroShards,
  #[error("refresh ahead requires a loader")]
  RefreshAheadWithoutLoader,
  #[error("loader thread count cannot be zero")]
  ZeroLoaderThreads,
  #[error("prefetch thread count cannot be zero")]
  ZeroPrefetchThreads,
  #[error("timer wheel size cannot be zero")]
  ZeroTimerWheelSize,
}

/// An error surfaced by a cache operation.
///
/// Loader failures are cached alongside regular values, so the same error may
/// be returned to many callers. The variant is cloneable for that reason; the
/// original failure is kept behind an `Arc` as the error source.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
  /// The loader returned an error for the given key.
  #[error("loader failed for key {key}")]
  Loader {
    key: String,
    #[source]
    source: Arc<dyn std::error::Error + Send + Sync + 'static>,
  },
}

impl CacheError {
  pub(crate) fn loader<K: fmt::Debug>(key: &K, source: LoadError) -> Self {
    CacheError::Loader {
      key: format!("{:?}", key),
      source: source.into(),
    }
  }

  /// Debug rendering of the key the failing load was for.
  pub fn key(&self) -> &str {
    match self {
      CacheError::Loader { key, .. } => key,
    }
  }
}
