//! Atomic per-entry read-modify-write operations.

use crate::entry::ValueSlot;
use crate::error::{CacheError, LoadError};
use crate::time;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Grants an entry processor the ability to pull the entry's value through
/// the loader on first read. Implemented by the engine core; the processor
/// view holds it instead of a back-pointer into the cache.
pub(crate) trait LoadCapability<K, V> {
  /// Runs the loader once for the processed key. `None` when the cache has
  /// no loader.
  fn load_for_entry(&self, key: &K) -> Option<(ValueSlot<V>, u64)>;
}

pub(crate) enum MutationOp<V> {
  None,
  SetValue(Arc<V>),
  SetException(CacheError),
  Remove,
}

/// The view an entry processor operates on.
///
/// Reads are lazy: the loader runs at most once, on the first call that
/// actually needs the value, and only when the entry has no fresh data.
/// Mutations are staged and applied atomically after the processor returns;
/// the last staged mutation wins. A processor that stages nothing leaves
/// the entry untouched.
pub struct MutableEntry<'a, K, V> {
  key: &'a K,
  pub(crate) slot: Option<ValueSlot<V>>,
  pub(crate) last_modification: Option<u64>,
  pub(crate) loaded: bool,
  pub(crate) load_performed: bool,
  pub(crate) load_time: u64,
  pub(crate) op: MutationOp<V>,
  capability: &'a dyn LoadCapability<K, V>,
}

impl<'a, K, V> MutableEntry<'a, K, V> {
  pub(crate) fn new(
    key: &'a K,
    slot: Option<ValueSlot<V>>,
    last_modification: Option<u64>,
    capability: &'a dyn LoadCapability<K, V>,
  ) -> Self {
    let loaded = slot.is_some();
    Self {
      key,
      slot,
      last_modification,
      loaded,
      load_performed: false,
      load_time: 0,
      op: MutationOp::None,
      capability,
    }
  }

  fn ensure_loaded(&mut self) {
    if self.loaded {
      return;
    }
    self.loaded = true;
    if let Some((slot, load_time)) = self.capability.load_for_entry(self.key) {
      self.slot = Some(slot);
      self.load_performed = true;
      self.load_time = load_time;
      self.last_modification = Some(load_time);
    }
  }

  pub fn key(&self) -> &K {
    self.key
  }

  /// Whether the entry holds data (a value or a cached exception),
  /// loading it first when a loader is configured.
  pub fn exists(&mut self) -> bool {
    self.ensure_loaded();
    self.slot.is_some()
  }

  /// The entry's value, pulled through the loader on first use.
  pub fn value(&mut self) -> Option<Arc<V>> {
    self.ensure_loaded();
    self.slot.as_ref().and_then(|slot| slot.value())
  }

  /// The cached loader error, if the entry holds one.
  pub fn exception(&mut self) -> Option<CacheError> {
    self.ensure_loaded();
    match &self.slot {
      Some(ValueSlot::Exception(error)) => Some(error.clone()),
      _ => None,
    }
  }

  /// When the entry's data was installed.
  pub fn last_modification(&mut self) -> Option<Instant> {
    self.ensure_loaded();
    self.last_modification.map(time::nanos_to_instant)
  }

  /// Stages a new value. Does not read the current one.
  pub fn set_value(&mut self, value: V) {
    self.op = MutationOp::SetValue(Arc::new(value));
  }

  /// Stages a loader-style error to be cached for this key.
  pub fn set_exception(&mut self, error: LoadError)
  where
    K: fmt::Debug,
  {
    self.op = MutationOp::SetException(CacheError::loader(self.key, error));
  }

  /// Stages removal of the entry.
  pub fn remove(&mut self) {
    self.op = MutationOp::Remove;
  }
}
