//! Expiry-time computation for values and cached loader errors.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::loader::PreviousEntry;
use crate::time;

use std::time::Duration;

#[inline]
fn after(load_time: u64, duration: Duration) -> u64 {
  load_time.saturating_add(duration.as_nanos() as u64)
}

/// Expiry time for a freshly loaded or stored value. A configured duration
/// acts as an upper bound on calculator results.
pub(crate) fn value_expiry<K, V>(
  config: &CacheConfig<K, V>,
  key: &K,
  value: &V,
  load_time: u64,
  previous: Option<&PreviousEntry<V>>,
) -> u64 {
  if config.eternal {
    return time::ETERNAL;
  }
  if let Some(calculator) = &config.expiry_calculator {
    let at = calculator(key, value, time::nanos_to_instant(load_time), previous);
    let at = match at {
      Some(at) => time::instant_to_nanos(at),
      None => time::ETERNAL,
    };
    return match config.expiry {
      Some(max) => at.min(after(load_time, max)),
      None => at,
    };
  }
  match config.expiry {
    Some(duration) => after(load_time, duration),
    None => time::ETERNAL,
  }
}

/// Retry time for a cached loader error. Without explicit configuration the
/// error is retained for a tenth of the value expiry; eternal caches do not
/// retain errors at all.
pub(crate) fn exception_expiry<K, V>(
  config: &CacheConfig<K, V>,
  key: &K,
  error: &CacheError,
  load_time: u64,
) -> u64 {
  if let Some(calculator) = &config.exception_expiry_calculator {
    let at = calculator(key, error, time::nanos_to_instant(load_time));
    let at = match at {
      Some(at) => time::instant_to_nanos(at),
      None => time::ETERNAL,
    };
    let max = config.exception_expiry.or(config.expiry);
    return match max {
      Some(max) => at.min(after(load_time, max)),
      None => at,
    };
  }
  if let Some(duration) = config.exception_expiry {
    return after(load_time, duration);
  }
  match config.expiry {
    Some(duration) => after(load_time, duration / 10),
    None => load_time,
  }
}
