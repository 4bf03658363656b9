use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

/// A fixed, lazily initialized point in time. All internal timestamps are
/// nanosecond offsets from this epoch, which keeps them in a single `u64`.
static CACHE_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Expiry timestamp of entries that never expire.
pub(crate) const ETERNAL: u64 = u64::MAX;

/// Current time as nanoseconds since the process epoch.
#[inline]
pub(crate) fn now_nanos() -> u64 {
  Instant::now().saturating_duration_since(*CACHE_EPOCH).as_nanos() as u64
}

#[inline]
pub(crate) fn nanos_to_instant(nanos: u64) -> Instant {
  *CACHE_EPOCH + Duration::from_nanos(nanos)
}

#[inline]
pub(crate) fn instant_to_nanos(at: Instant) -> u64 {
  at.saturating_duration_since(*CACHE_EPOCH).as_nanos() as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nanos_are_monotonic() {
    let a = now_nanos();
    let b = now_nanos();
    assert!(b >= a);
  }

  #[test]
  fn instant_round_trip() {
    let now = now_nanos();
    let back = instant_to_nanos(nanos_to_instant(now));
    assert_eq!(now, back);
  }
}
