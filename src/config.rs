use crate::error::CacheError;
use crate::loader::PreviousEntry;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Computes the point in time a freshly loaded value stops being fresh.
/// `None` means the value never expires.
pub type ExpiryCalculator<K, V> =
  Arc<dyn Fn(&K, &V, Instant, Option<&PreviousEntry<V>>) -> Option<Instant> + Send + Sync>;

/// Computes the retry time for a cached loader error. `None` keeps the
/// error eternally.
pub type ExceptionExpiryCalculator<K> =
  Arc<dyn Fn(&K, &CacheError, Instant) -> Option<Instant> + Send + Sync>;

/// Immutable configuration snapshot, fixed at build time.
pub(crate) struct CacheConfig<K, V> {
  pub(crate) name: String,
  pub(crate) entry_capacity: u64,
  pub(crate) eternal: bool,
  pub(crate) expiry: Option<Duration>,
  pub(crate) exception_expiry: Option<Duration>,
  pub(crate) refresh_ahead: bool,
  pub(crate) sharp_expiry: bool,
  pub(crate) keep_data_after_expired: bool,
  pub(crate) suppress_exceptions: bool,
  pub(crate) expiry_calculator: Option<ExpiryCalculator<K, V>>,
  pub(crate) exception_expiry_calculator: Option<ExceptionExpiryCalculator<K>>,
}

impl<K, V> CacheConfig<K, V> {
  /// Whether the capacity bound is active.
  #[inline]
  pub(crate) fn is_bounded(&self) -> bool {
    self.entry_capacity != u64::MAX
  }
}
