use crate::error::CacheError;
use crate::time;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
  /// Created but never populated. Always pinned by its creator.
  Empty,
  /// A loader invocation is populating the entry.
  Loading,
  /// Holds servable data.
  Present,
  /// A put or entry-processor mutation is in progress.
  ProcessingMutation,
  /// Data passed its expiry time; retained only when configured to.
  Expired,
  /// Detached from the store. Terminal; operations holding this entry retry.
  Removed,
}

/// The cached outcome of a load: a user value or the error the loader
/// produced. Errors are cached and rethrown like values.
pub(crate) enum ValueSlot<V> {
  Value(Arc<V>),
  Exception(CacheError),
}

impl<V> Clone for ValueSlot<V> {
  fn clone(&self) -> Self {
    match self {
      ValueSlot::Value(v) => ValueSlot::Value(v.clone()),
      ValueSlot::Exception(e) => ValueSlot::Exception(e.clone()),
    }
  }
}

impl<V> ValueSlot<V> {
  pub(crate) fn value(&self) -> Option<Arc<V>> {
    match self {
      ValueSlot::Value(v) => Some(v.clone()),
      ValueSlot::Exception(_) => None,
    }
  }

  pub(crate) fn to_result(&self) -> Result<Arc<V>, CacheError> {
    match self {
      ValueSlot::Value(v) => Ok(v.clone()),
      ValueSlot::Exception(e) => Err(e.clone()),
    }
  }
}

/// Mutable portion of an entry, guarded by the entry mutex.
pub(crate) struct EntryInner<V> {
  pub(crate) state: EntryState,
  pub(crate) slot: Option<ValueSlot<V>>,
  /// Nanoseconds since the process epoch; `time::ETERNAL` never expires.
  pub(crate) expiry_time: u64,
  pub(crate) last_modification: u64,
  /// Set after a refresh-ahead replace; cleared by the first access.
  pub(crate) refresh_probation: bool,
  /// Nonzero while an operation holds exclusive use of this entry.
  pub(crate) pin_count: u32,
  /// A removal arrived while pinned; applied when the pin is released.
  pub(crate) deferred_remove: bool,
  /// Bumped on every data install. Invalidates stale timer events.
  pub(crate) generation: u64,
}

impl<V> EntryInner<V> {
  #[inline]
  pub(crate) fn is_fresh(&self, now: u64) -> bool {
    now < self.expiry_time
  }
}

/// A single cache mapping. Entries are shared as `Arc` between the store,
/// operations in flight, and queued loader jobs; identity comparison via
/// `Arc::ptr_eq` detects replacement races.
pub(crate) struct CacheEntry<K, V> {
  pub(crate) key: K,
  /// Key hash captured at insertion, used to detect keys mutated afterwards.
  pub(crate) key_hash: u64,
  pub(crate) inner: Mutex<EntryInner<V>>,
  /// Notified whenever a pin is released or the state settles.
  pub(crate) settled: Condvar,
}

impl<K, V> CacheEntry<K, V> {
  /// A new entry, born pinned in `Empty` so the creator can transition it
  /// without another acquisition.
  pub(crate) fn new_pinned(key: K, key_hash: u64) -> Self {
    Self {
      key,
      key_hash,
      inner: Mutex::new(EntryInner {
        state: EntryState::Empty,
        slot: None,
        expiry_time: 0,
        last_modification: time::now_nanos(),
        refresh_probation: false,
        pin_count: 1,
        deferred_remove: false,
        generation: 0,
      }),
      settled: Condvar::new(),
    }
  }
}
