//! The public cache handle.

use crate::completion::CompletionListener;
use crate::entry::{EntryState, ValueSlot};
use crate::error::CacheError;
use crate::loader::PreviousEntry;
use crate::metrics::StatisticsSnapshot;
use crate::processor::{LoadCapability, MutableEntry, MutationOp};
use crate::shared::{BatchIntent, CacheShared, ProcessorOutcome};
use crate::time;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};

/// A concurrent, in-process, read-through cache.
///
/// `get` consults the configured loader on a miss; concurrent gets for the
/// same key collapse onto one loader invocation. Loader errors are cached
/// and rethrown like values. Built via [`crate::CacheBuilder`].
pub struct Cache<K: Send, V: Send + Sync, H = ahash::RandomState> {
  shared: Arc<CacheShared<K, V, H>>,
}

impl<K: Send, V: Send + Sync, H> fmt::Debug for Cache<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache")
      .field("shared", &self.shared)
      .finish()
  }
}

struct ProcessorLoad<'c, K: Send, V: Send + Sync, H> {
  shared: &'c CacheShared<K, V, H>,
}

impl<'c, K, V, H> LoadCapability<K, V> for ProcessorLoad<'c, K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  fn load_for_entry(&self, key: &K) -> Option<(ValueSlot<V>, u64)> {
    self.shared.load_for_processor(key)
  }
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn from_shared(shared: Arc<CacheShared<K, V, H>>) -> Self {
    Self { shared }
  }

  /// The cache name given at build time.
  pub fn name(&self) -> &str {
    &self.shared.config.name
  }

  /// Returns the value for `key`, invoking the loader when nothing fresh
  /// is cached. Without a loader this behaves like [`Cache::peek`] except
  /// that it blocks behind an in-flight load for the key.
  ///
  /// A cached loader failure is returned as `Err` until it expires.
  pub fn get(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.get_value(key)
  }

  /// Bulk `get`. Keys are loaded sequentially on the calling thread; use
  /// [`Cache::load_all`] to employ the loader pool. Stops at the first
  /// error.
  pub fn get_all<I>(&self, keys: I) -> Result<HashMap<K, Arc<V>>, CacheError>
  where
    I: IntoIterator<Item = K>,
  {
    let mut out = HashMap::new();
    for key in keys {
      if out.contains_key(&key) {
        continue;
      }
      if let Some(value) = self.shared.get_value(&key)? {
        out.insert(key, value);
      }
    }
    Ok(out)
  }

  /// Returns the cached value without ever invoking the loader. Never
  /// blocks behind loads; an entry mid-load reads as absent.
  pub fn peek(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.peek_value(key)
  }

  /// Inserts or replaces the value for `key`.
  pub fn put(&self, key: &K, value: V) {
    self.shared.put_value(key, value);
  }

  /// Whether a fresh value or cached exception is servable right now.
  /// Never invokes the loader.
  pub fn contains_key(&self, key: &K) -> bool {
    self.shared.contains(key)
  }

  /// Removes the mapping for `key`. Returns whether a mapping existed. A
  /// removal racing an in-flight operation on the key is applied when that
  /// operation settles.
  pub fn remove(&self, key: &K) -> bool {
    self.shared.remove_value(key)
  }

  /// Asynchronously loads the given keys that are not already fresh in the
  /// cache. The listener fires once after every key settled.
  pub fn load_all<I>(&self, keys: I, listener: Option<Arc<dyn CompletionListener>>)
  where
    I: IntoIterator<Item = K>,
  {
    self
      .shared
      .submit_batch(keys.into_iter().collect(), BatchIntent::Load, listener);
  }

  /// Asynchronously loads the given keys unconditionally, replacing fresh
  /// values.
  pub fn reload_all<I>(&self, keys: I, listener: Option<Arc<dyn CompletionListener>>)
  where
    I: IntoIterator<Item = K>,
  {
    self
      .shared
      .submit_batch(keys.into_iter().collect(), BatchIntent::Reload, listener);
  }

  /// Hints that `key` will be needed soon. Never blocks the caller: when
  /// the prefetch pool is saturated the hint is dropped.
  pub fn prefetch(&self, key: &K) {
    self
      .shared
      .submit_batch(vec![key.clone()], BatchIntent::Prefetch, None);
  }

  /// Bulk [`Cache::prefetch`] with an optional completion listener.
  pub fn prefetch_all<I>(&self, keys: I, listener: Option<Arc<dyn CompletionListener>>)
  where
    I: IntoIterator<Item = K>,
  {
    self
      .shared
      .submit_batch(keys.into_iter().collect(), BatchIntent::Prefetch, listener);
  }

  /// Runs `processor` against the entry for `key` with all other access to
  /// that key excluded. See [`MutableEntry`] for the staged-mutation rules.
  pub fn invoke<R>(
    &self,
    key: &K,
    processor: impl FnOnce(&mut MutableEntry<'_, K, V>) -> R,
  ) -> R {
    let (guard, entry, prior_state) = self.shared.acquire_for_processing(key);
    let (snapshot, last_modification) = self.shared.processor_snapshot(&entry, prior_state);

    let previous = snapshot.as_ref().map(|slot| PreviousEntry {
      value: slot.value(),
      exception: match slot {
        ValueSlot::Exception(error) => Some(error.clone()),
        ValueSlot::Value(_) => None,
      },
      last_modification: last_modification.unwrap_or(0),
    });

    let capability = ProcessorLoad {
      shared: self.shared.as_ref(),
    };
    let mut view = MutableEntry::new(key, snapshot, last_modification, &capability);
    let result = processor(&mut view);

    let load_performed = view.load_performed;
    let load_time = view.load_time;
    let op = view.op;
    let slot = view.slot;

    let outcome = match op {
      MutationOp::SetValue(value) => ProcessorOutcome::SetValue(value),
      MutationOp::SetException(error) => ProcessorOutcome::SetException(error),
      MutationOp::Remove => {
        if prior_state == EntryState::Empty && !load_performed {
          // Removing an entry that never existed is a no-op.
          ProcessorOutcome::Untouched
        } else {
          ProcessorOutcome::Remove
        }
      }
      MutationOp::None => match (load_performed, slot) {
        (true, Some(slot)) => ProcessorOutcome::KeepLoaded(slot, load_time),
        _ => ProcessorOutcome::Untouched,
      },
    };
    self
      .shared
      .apply_processor_outcome(guard, key, outcome, previous);
    result
  }

  /// Runs `processor` against each key, each under its own exclusion.
  pub fn invoke_all<I, R>(
    &self,
    keys: I,
    processor: impl Fn(&mut MutableEntry<'_, K, V>) -> R,
  ) -> HashMap<K, R>
  where
    I: IntoIterator<Item = K>,
  {
    let mut out = HashMap::new();
    for key in keys {
      if out.contains_key(&key) {
        continue;
      }
      let result = self.invoke(&key, &processor);
      out.insert(key, result);
    }
    out
  }

  /// Discards every entry. Operations in flight settle against detached
  /// entries and cannot resurrect them.
  pub fn clear(&self) {
    self.shared.clear_all();
  }

  /// Visits every fresh value. The iteration is weakly consistent: entries
  /// added or removed concurrently may or may not be observed.
  pub fn for_each(&self, mut visitor: impl FnMut(&K, &Arc<V>)) {
    for entry in self.shared.store.collect_entries() {
      let slot = {
        let inner = entry.inner.lock();
        if inner.state == EntryState::Present && inner.is_fresh(time::now_nanos()) {
          inner.slot.clone()
        } else {
          None
        }
      };
      if let Some(ValueSlot::Value(value)) = slot {
        visitor(&entry.key, &value);
      }
    }
  }

  /// Number of entries, including expired ones not yet detached.
  pub fn len(&self) -> u64 {
    self.shared.store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// A point-in-time statistics snapshot. All counters read zero when the
  /// cache was built with statistics disabled.
  pub fn statistics(&self) -> StatisticsSnapshot {
    let mut snapshot = self.shared.stats.snapshot();
    snapshot.entry_count = self.shared.store.len();
    snapshot.longest_slot = self.shared.store.longest_slot();
    snapshot.collision_percentage = self.shared.store.collision_percentage();
    snapshot
  }
}
