//! The engine core shared by every cache handle and background thread.
//!
//! All per-key mutual exclusion goes through entry pins: an operation that
//! wants to mutate an entry acquires its pin, transitions the state, does
//! its work without holding the entry mutex, and settles. Readers only take
//! the entry mutex briefly or block on the `settled` condvar.
//!
//! Lock order: an entry mutex may be held while taking a shard lock, never
//! the reverse for an entry that is already in the store.

use crate::completion::{BatchContext, CompletionListener};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryInner, EntryState, ValueSlot};
use crate::error::CacheError;
use crate::expiry;
use crate::loader::{Loader, PreviousEntry};
use crate::metrics::StatCounters;
use crate::policy::EvictionPolicy;
use crate::pool::{Job, LoaderPool};
use crate::store::{EntryStore, RemoveOutcome};
use crate::task::timer::{ExpiryDriver, TimerWheel};
use crate::time;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Entries the capacity enforcer will inspect before giving up when every
/// candidate is pinned by an operation in flight.
const MAX_EVICTION_ATTEMPTS: usize = 16;

/// What kind of read-through triggered a loader invocation. Drives which
/// statistics counter the load lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadIntent {
  /// A read found nothing servable.
  Read,
  /// An explicit `load_all`.
  Load,
  /// An explicit `reload_all`.
  Reload,
  /// Refresh-ahead replacing data before it expires.
  Refresh,
}

/// Bulk operation flavors. They differ in skip and backpressure behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchIntent {
  Load,
  Reload,
  Prefetch,
}

pub(crate) struct CacheShared<K: Send, V: Send + Sync, H> {
  pub(crate) config: CacheConfig<K, V>,
  pub(crate) store: EntryStore<K, V, H>,
  pub(crate) stats: StatCounters,
  pub(crate) policy: Box<dyn EvictionPolicy<K>>,
  pub(crate) loader: Option<Loader<K, V>>,
  pub(crate) loader_pool: Option<Arc<LoaderPool>>,
  pub(crate) prefetch_pool: Option<Arc<LoaderPool>>,
  pub(crate) timer_wheel: Option<TimerWheel<K>>,
  // Installed after the Arc exists; the driver holds the core weakly.
  pub(crate) expiry_driver: Mutex<Option<ExpiryDriver>>,
}

impl<K: Send, V: Send + Sync, H> fmt::Debug for CacheShared<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("name", &self.config.name)
      .field("entry_capacity", &self.config.entry_capacity)
      .field("has_loader", &self.loader.is_some())
      .finish_non_exhaustive()
  }
}

impl<K: Send, V: Send + Sync, H> Drop for CacheShared<K, V, H> {
  fn drop(&mut self) {
    if let Some(driver) = self.expiry_driver.get_mut().take() {
      driver.stop();
    }
  }
}

/// RAII pin on one entry. Exactly one guard exists per pinned entry.
///
/// `settle` applies a final state transition, releases the pin and wakes
/// waiters. Dropping the guard without settling aborts: a created entry is
/// removed again, anything else returns to its prior state. Either path
/// honors a removal that was deferred while the pin was held.
pub(crate) struct PinGuard<'a, K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  shared: &'a CacheShared<K, V, H>,
  entry: Arc<CacheEntry<K, V>>,
  prior_state: EntryState,
  created: bool,
  released: bool,
}

impl<'a, K, V, H> PinGuard<'a, K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn entry(&self) -> &Arc<CacheEntry<K, V>> {
    &self.entry
  }

  /// Applies the final transition and releases the pin.
  pub(crate) fn settle<F: FnOnce(&mut EntryInner<V>)>(mut self, apply: F) {
    self.released = true;
    let detach = {
      let mut inner = self.entry.inner.lock();
      apply(&mut inner);
      inner.pin_count = 0;
      if inner.deferred_remove && inner.state != EntryState::Removed {
        inner.state = EntryState::Removed;
        inner.slot = None;
      }
      self.entry.settled.notify_all();
      inner.state == EntryState::Removed
    };
    if detach {
      self.shared.finish_remove(&self.entry);
    }
  }
}

impl<'a, K, V, H> Drop for PinGuard<'a, K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  fn drop(&mut self) {
    if self.released {
      return;
    }
    // Abort path, including unwinding out of a panicking loader.
    let detach = {
      let mut inner = self.entry.inner.lock();
      if self.created || inner.deferred_remove {
        inner.state = EntryState::Removed;
        inner.slot = None;
      } else {
        inner.state = self.prior_state;
      }
      inner.pin_count = 0;
      self.entry.settled.notify_all();
      inner.state == EntryState::Removed
    };
    if detach {
      self.shared.finish_remove(&self.entry);
    }
  }
}

fn previous_view<V>(inner: &EntryInner<V>) -> Option<PreviousEntry<V>> {
  inner.slot.as_ref().map(|slot| PreviousEntry {
    value: slot.value(),
    exception: match slot {
      ValueSlot::Exception(error) => Some(error.clone()),
      ValueSlot::Value(_) => None,
    },
    last_modification: inner.last_modification,
  })
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn timer_wheel(&self) -> Option<&TimerWheel<K>> {
    self.timer_wheel.as_ref()
  }

  // ---- pin management -------------------------------------------------

  fn adopt_pin(
    &self,
    entry: &Arc<CacheEntry<K, V>>,
    prior_state: EntryState,
    created: bool,
  ) -> PinGuard<'_, K, V, H> {
    PinGuard {
      shared: self,
      entry: entry.clone(),
      prior_state,
      created,
      released: false,
    }
  }

  /// Takes over the pin a freshly created entry was born with.
  fn adopt_created(
    &self,
    entry: &Arc<CacheEntry<K, V>>,
    next: EntryState,
  ) -> PinGuard<'_, K, V, H> {
    {
      let mut inner = entry.inner.lock();
      debug_assert_eq!(inner.pin_count, 1);
      inner.state = next;
    }
    self.adopt_pin(entry, EntryState::Empty, true)
  }

  /// Waits for the entry to become unpinned, then pins it and transitions
  /// to `next`. `None` means the entry was removed while waiting; the
  /// caller retries against the store.
  fn acquire_pin(
    &self,
    entry: &Arc<CacheEntry<K, V>>,
    next: EntryState,
  ) -> Option<PinGuard<'_, K, V, H>> {
    let prior_state = {
      let mut inner = entry.inner.lock();
      loop {
        if inner.state == EntryState::Removed {
          return None;
        }
        if inner.pin_count == 0 {
          break;
        }
        entry.settled.wait(&mut inner);
      }
      inner.pin_count = 1;
      let prior = inner.state;
      inner.state = next;
      prior
    };
    Some(self.adopt_pin(entry, prior_state, false))
  }

  // ---- store plumbing --------------------------------------------------

  /// Looks up or creates the entry, feeding the eviction policy and the
  /// capacity bound on creation.
  fn create_entry(&self, key: &K) -> (Arc<CacheEntry<K, V>>, bool) {
    let (entry, created) = self.store.lookup_or_create(key);
    if created {
      self.policy.on_insert(key);
      self.enforce_capacity();
    }
    (entry, created)
  }

  /// Detaches the entry from the store, counting a detected key-hash
  /// mutation instead of correcting it.
  fn detach_entry(&self, entry: &Arc<CacheEntry<K, V>>) {
    match self.store.remove_entry(entry) {
      RemoveOutcome::Removed | RemoveOutcome::AlreadyGone => {}
      RemoveOutcome::HashMutated => {
        self.stats.key_mutated();
        log::debug!(
          "cache '{}': key hash changed after insertion, mapping abandoned",
          self.config.name
        );
      }
    }
  }

  fn finish_remove(&self, entry: &Arc<CacheEntry<K, V>>) {
    self.detach_entry(entry);
    self.policy.on_remove(&entry.key);
  }

  /// Flips a stale entry to `Expired` under its lock, dropping the data
  /// unless configured to keep it.
  fn mark_expired_locked(&self, inner: &mut EntryInner<V>) {
    inner.state = EntryState::Expired;
    if self.config.keep_data_after_expired {
      self.stats.expired_kept();
    } else {
      inner.slot = None;
    }
  }

  // ---- load execution --------------------------------------------------

  /// Installs loaded or stored data, settles the pin and arms the expiry
  /// timer. Data already expired at install time collapses the entry.
  fn install(
    &self,
    guard: PinGuard<'_, K, V, H>,
    slot: ValueSlot<V>,
    expiry_time: u64,
    load_time: u64,
    probation: bool,
  ) {
    let key = guard.entry().key.clone();
    let now = time::now_nanos();
    let mut generation = 0;
    guard.settle(|inner| {
      inner.slot = Some(slot);
      inner.last_modification = load_time;
      inner.refresh_probation = probation;
      inner.expiry_time = expiry_time;
      inner.generation += 1;
      generation = inner.generation;
      if expiry_time <= now {
        if self.config.keep_data_after_expired {
          inner.state = EntryState::Expired;
          self.stats.expired_kept();
        } else {
          inner.state = EntryState::Removed;
          inner.slot = None;
        }
      } else {
        inner.state = EntryState::Present;
      }
    });
    if expiry_time > now && expiry_time != time::ETERNAL {
      if let Some(wheel) = &self.timer_wheel {
        wheel.schedule(key, generation, Duration::from_nanos(expiry_time - now));
      }
    }
  }

  /// Runs the loader for a pinned entry and installs the outcome. The entry
  /// mutex is not held across the loader call; the pin alone serializes.
  fn execute_load(
    &self,
    guard: PinGuard<'_, K, V, H>,
    previous: Option<PreviousEntry<V>>,
    intent: LoadIntent,
  ) -> ValueSlot<V> {
    // Only reachable with a configured loader.
    let loader = match &self.loader {
      Some(loader) => loader,
      None => {
        self.stats.internal_exception();
        let error = CacheError::loader(&guard.entry().key, "no loader configured".into());
        let slot = ValueSlot::Exception(error);
        let now = time::now_nanos();
        self.install(guard, slot.clone(), now, now, false);
        return slot;
      }
    };

    let load_time = time::now_nanos();
    let started = Instant::now();
    let result = loader.load(&guard.entry().key, load_time, previous.as_ref());
    let millis = started.elapsed().as_millis() as u64;

    match result {
      Ok(value) => {
        match intent {
          LoadIntent::Refresh => self.stats.refresh(millis),
          // Replacing existing data is a reload regardless of what asked
          // for it; a reload of a vanished entry is a plain load.
          _ if previous.is_some() => self.stats.reload(millis),
          _ => self.stats.load(millis),
        }
        let expiry_time =
          expiry::value_expiry(&self.config, &guard.entry().key, &value, load_time, previous.as_ref());
        let slot = ValueSlot::Value(Arc::new(value));
        self.install(
          guard,
          slot.clone(),
          expiry_time,
          load_time,
          intent == LoadIntent::Refresh,
        );
        slot
      }
      Err(source) => {
        self.stats.load_exception();
        let error = CacheError::loader(&guard.entry().key, source);
        let previous_value = previous.as_ref().and_then(|p| p.value().cloned());
        match previous_value {
          Some(value) if self.config.suppress_exceptions => {
            // Keep serving the old value; the exception expiry governs
            // when the load is retried.
            self.stats.suppressed_exception();
            log::warn!("cache '{}': suppressed {}", self.config.name, error);
            let retry_at = expiry::exception_expiry(&self.config, &guard.entry().key, &error, load_time);
            let slot = ValueSlot::Value(value);
            self.install(guard, slot.clone(), retry_at, load_time, false);
            slot
          }
          _ => {
            let expiry_time =
              expiry::exception_expiry(&self.config, &guard.entry().key, &error, load_time);
            let slot = ValueSlot::Exception(error);
            self.install(guard, slot.clone(), expiry_time, load_time, false);
            slot
          }
        }
      }
    }
  }

  // ---- single-key operations --------------------------------------------

  /// Read-through get. Blocks behind an in-flight load for the same key and
  /// invokes the loader when nothing servable is cached.
  pub(crate) fn get_value(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    loop {
      let entry = match self.store.lookup(key) {
        Some(entry) => entry,
        None => {
          if self.loader.is_none() {
            self.stats.miss();
            return Ok(None);
          }
          let (entry, created) = self.create_entry(key);
          if created {
            self.stats.miss();
            let guard = self.adopt_created(&entry, EntryState::Loading);
            let slot = self.execute_load(guard, None, LoadIntent::Read);
            return slot.to_result().map(Some);
          }
          entry
        }
      };

      let mut inner = entry.inner.lock();
      loop {
        let now = time::now_nanos();
        match inner.state {
          EntryState::Removed => {
            // Raced a removal; retry against the store.
            drop(inner);
            self.stats.gone_spin();
            break;
          }
          EntryState::Present => {
            if inner.is_fresh(now) {
              if inner.refresh_probation {
                inner.refresh_probation = false;
                self.stats.refresh_hit();
              }
              let slot = inner.slot.clone();
              drop(inner);
              self.stats.hit();
              self.policy.on_access(key);
              return match slot {
                Some(slot) => slot.to_result().map(Some),
                None => {
                  self.stats.internal_exception();
                  Ok(None)
                }
              };
            }
            if inner.pin_count > 0 {
              // A refresh is replacing the data; serve the stale value.
              let slot = inner.slot.clone();
              drop(inner);
              self.stats.hit();
              return match slot {
                Some(slot) => slot.to_result().map(Some),
                None => Ok(None),
              };
            }
            self.mark_expired_locked(&mut inner);
          }
          EntryState::Expired => {
            if inner.pin_count > 0 {
              entry.settled.wait(&mut inner);
              continue;
            }
            if self.loader.is_none() {
              drop(inner);
              self.stats.miss();
              return Ok(None);
            }
            self.stats.miss();
            inner.pin_count = 1;
            let prior = inner.state;
            inner.state = EntryState::Loading;
            let previous = previous_view(&inner);
            drop(inner);
            let guard = self.adopt_pin(&entry, prior, false);
            let slot = self.execute_load(guard, previous, LoadIntent::Read);
            return slot.to_result().map(Some);
          }
          EntryState::Empty | EntryState::Loading | EntryState::ProcessingMutation => {
            entry.settled.wait(&mut inner);
          }
        }
      }
    }
  }

  /// Read without loader invocation. Never blocks behind loads.
  pub(crate) fn peek_value(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    let entry = match self.store.lookup(key) {
      Some(entry) => entry,
      None => {
        self.stats.peek_miss();
        return Ok(None);
      }
    };
    let inner = entry.inner.lock();
    let now = time::now_nanos();
    match inner.state {
      EntryState::Present if inner.is_fresh(now) => {
        let slot = inner.slot.clone();
        drop(inner);
        match slot {
          Some(slot) => slot.to_result().map(Some),
          None => Ok(None),
        }
      }
      EntryState::Present | EntryState::Expired => {
        drop(inner);
        self.stats.peek_hit_not_fresh();
        Ok(None)
      }
      _ => {
        drop(inner);
        self.stats.peek_miss();
        Ok(None)
      }
    }
  }

  pub(crate) fn put_value(&self, key: &K, value: V) {
    let value = Arc::new(value);
    loop {
      let (entry, created) = self.create_entry(key);
      let guard = if created {
        self.adopt_created(&entry, EntryState::ProcessingMutation)
      } else {
        match self.acquire_pin(&entry, EntryState::ProcessingMutation) {
          Some(guard) => guard,
          None => {
            self.stats.gone_spin();
            continue;
          }
        }
      };
      let previous = previous_view(&entry.inner.lock());
      if previous.is_some() {
        self.stats.put_hit();
      } else {
        self.stats.put_new_entry();
      }
      let load_time = time::now_nanos();
      let expiry_time =
        expiry::value_expiry(&self.config, key, &value, load_time, previous.as_ref());
      self.install(guard, ValueSlot::Value(value), expiry_time, load_time, false);
      return;
    }
  }

  /// Removes the mapping. A pinned entry is marked for deferred removal and
  /// detached when its current operation settles.
  pub(crate) fn remove_value(&self, key: &K) -> bool {
    let entry = match self.store.lookup(key) {
      Some(entry) => entry,
      None => return false,
    };
    let detach = {
      let mut inner = entry.inner.lock();
      if inner.state == EntryState::Removed {
        return false;
      }
      if inner.pin_count > 0 {
        inner.deferred_remove = true;
        false
      } else {
        inner.state = EntryState::Removed;
        inner.slot = None;
        entry.settled.notify_all();
        true
      }
    };
    if detach {
      self.finish_remove(&entry);
    }
    self.stats.removal();
    true
  }

  /// True when a fresh value or cached exception is servable right now.
  pub(crate) fn contains(&self, key: &K) -> bool {
    match self.store.lookup(key) {
      Some(entry) => {
        let inner = entry.inner.lock();
        inner.state == EntryState::Present
          && inner.is_fresh(time::now_nanos())
          && inner.slot.is_some()
      }
      None => false,
    }
  }

  fn is_fresh_present(&self, key: &K) -> bool {
    self.contains(key)
  }

  pub(crate) fn clear_all(&self) {
    let entries = self.store.drain_all();
    let mut cleared = 0u64;
    for entry in &entries {
      let mut inner = entry.inner.lock();
      if inner.state == EntryState::Removed {
        continue;
      }
      if inner.pin_count > 0 {
        inner.deferred_remove = true;
      } else {
        inner.state = EntryState::Removed;
        inner.slot = None;
        entry.settled.notify_all();
      }
      cleared += 1;
    }
    self.policy.clear();
    self.stats.clear_op(cleared);
  }

  // ---- bulk operations ---------------------------------------------------

  /// Loads one key as part of a batch, collapsing onto in-flight work.
  fn load_one(&self, key: &K, intent: BatchIntent) -> Result<(), CacheError> {
    loop {
      let (entry, created) = self.create_entry(key);
      if created {
        let guard = self.adopt_created(&entry, EntryState::Loading);
        let load_intent = if intent == BatchIntent::Reload {
          LoadIntent::Reload
        } else {
          LoadIntent::Load
        };
        return match self.execute_load(guard, None, load_intent) {
          ValueSlot::Exception(error) => Err(error),
          ValueSlot::Value(_) => Ok(()),
        };
      }

      let mut inner = entry.inner.lock();
      loop {
        let now = time::now_nanos();
        match inner.state {
          EntryState::Removed => {
            drop(inner);
            self.stats.gone_spin();
            break;
          }
          EntryState::Present if intent != BatchIntent::Reload && inner.is_fresh(now) => {
            // Already fresh; the batch does not touch it.
            return Ok(());
          }
          EntryState::Present | EntryState::Expired => {
            if inner.pin_count > 0 {
              if intent == BatchIntent::Prefetch {
                // Someone else is producing data; good enough.
                return Ok(());
              }
              entry.settled.wait(&mut inner);
              continue;
            }
            inner.pin_count = 1;
            let prior = inner.state;
            inner.state = EntryState::Loading;
            let previous = previous_view(&inner);
            drop(inner);
            let guard = self.adopt_pin(&entry, prior, false);
            let load_intent = if intent == BatchIntent::Reload {
              LoadIntent::Reload
            } else {
              LoadIntent::Load
            };
            return match self.execute_load(guard, previous, load_intent) {
              ValueSlot::Exception(error) => Err(error),
              ValueSlot::Value(_) => Ok(()),
            };
          }
          EntryState::Empty | EntryState::Loading | EntryState::ProcessingMutation => {
            if intent == BatchIntent::Prefetch {
              return Ok(());
            }
            entry.settled.wait(&mut inner);
          }
        }
      }
    }
  }

  /// Dispatches a batch across the loader pool. Saturation runs `load_all`
  /// and `reload_all` jobs on the submitting thread; prefetch jobs are
  /// dropped instead.
  pub(crate) fn submit_batch(
    self: &Arc<Self>,
    keys: Vec<K>,
    intent: BatchIntent,
    listener: Option<Arc<dyn CompletionListener>>,
  ) {
    use ahash::{HashSet, HashSetExt};

    let mut seen = HashSet::with_capacity(keys.len());
    let mut unique = Vec::with_capacity(keys.len());
    for key in keys {
      if seen.insert(key.clone()) {
        unique.push(key);
      }
    }

    // Settle skippable keys up front so dispatch counts reflect real work.
    let mut pending = Vec::with_capacity(unique.len());
    let mut skipped = 0usize;
    for key in unique {
      if self.loader.is_none() || (intent != BatchIntent::Reload && self.is_fresh_present(&key)) {
        skipped += 1;
      } else {
        pending.push(key);
      }
    }

    let ctx = BatchContext::new(pending.len() + skipped, listener);
    for _ in 0..skipped {
      ctx.settle_ok();
    }
    if pending.is_empty() {
      if skipped == 0 {
        ctx.fire_empty();
      }
      return;
    }

    let pool = match intent {
      BatchIntent::Prefetch => self.prefetch_pool.clone(),
      _ => self.loader_pool.clone(),
    };
    let Some(pool) = pool else {
      // No loader means no pool; everything already settled above.
      for _ in 0..pending.len() {
        ctx.settle_ok();
      }
      return;
    };

    for key in pending {
      let shared = Arc::clone(self);
      let batch = ctx.clone();
      let run = move || match shared.load_one(&key, intent) {
        Ok(()) => batch.settle_ok(),
        Err(error) => batch.settle_err(error),
      };

      match pool.reserve() {
        Some(reservation) => {
          self.stats.async_load_started();
          let counted = Arc::clone(self);
          let job: Job = Box::new(move || {
            counted.stats.async_load_entered();
            run();
            counted.stats.async_load_exited();
          });
          pool.dispatch(reservation, job);
        }
        None => match intent {
          BatchIntent::Prefetch => {
            // Best effort by contract: drop the task, settle the key.
            ctx.settle_ok();
          }
          _ => {
            self.stats.caller_run();
            run();
          }
        },
      }
    }
  }

  // ---- timer events --------------------------------------------------------

  /// Processes one due timer. Stale generations, missing entries and
  /// pinned entries invalidate the event.
  pub(crate) fn handle_timer_event(self: &Arc<Self>, key: &K, generation: u64) {
    self.stats.timer_event();
    let entry = match self.store.lookup(key) {
      Some(entry) => entry,
      None => return,
    };
    let mut inner = entry.inner.lock();
    if inner.generation != generation
      || inner.pin_count > 0
      || inner.state != EntryState::Present
    {
      return;
    }
    let now = time::now_nanos();
    if inner.is_fresh(now) {
      // Fired a wheel-granularity tick early; push it back out.
      let remaining = Duration::from_nanos(inner.expiry_time - now);
      drop(inner);
      if let Some(wheel) = &self.timer_wheel {
        wheel.schedule(key.clone(), generation, remaining);
      }
      return;
    }

    if self.config.refresh_ahead && self.loader.is_some() && !inner.refresh_probation {
      // Refresh instead of expiring. The entry stays Present and servable
      // while pinned for the reload.
      inner.pin_count = 1;
      let previous = previous_view(&inner);
      drop(inner);

      let submitted = self.loader_pool.as_ref().and_then(|pool| {
        pool.reserve().map(|reservation| {
          self.stats.async_load_started();
          let shared = Arc::clone(self);
          let entry_arc = entry.clone();
          let job: Job = Box::new(move || {
            shared.stats.async_load_entered();
            let guard = shared.adopt_pin(&entry_arc, EntryState::Present, false);
            let _ = shared.execute_load(guard, previous, LoadIntent::Refresh);
            shared.stats.async_load_exited();
          });
          pool.dispatch(reservation, job);
        })
      });

      if submitted.is_none() {
        // Pool saturated; fall back to plain expiry. Settling through a
        // guard applies a removal deferred while the pin was held.
        self.stats.refresh_submit_failed();
        log::debug!(
          "cache '{}': refresh of a key could not be scheduled, expiring instead",
          self.config.name
        );
        let guard = self.adopt_pin(&entry, EntryState::Present, false);
        guard.settle(|inner| self.mark_expired_locked(inner));
      }
    } else {
      self.mark_expired_locked(&mut inner);
      entry.settled.notify_all();
    }
  }

  // ---- capacity -------------------------------------------------------------

  /// Evicts until the store honors the capacity bound. Pinned candidates
  /// are handed back to the policy; if only pinned candidates remain the
  /// cache runs over capacity temporarily.
  fn enforce_capacity(&self) {
    if !self.config.is_bounded() {
      return;
    }
    let mut attempts = 0usize;
    while self.store.len() > self.config.entry_capacity {
      let victim_key = match self.policy.choose_victim() {
        Some(key) => key,
        None => return,
      };
      let victim = match self.store.lookup(&victim_key) {
        Some(entry) => entry,
        None => {
          attempts += 1;
          if attempts >= MAX_EVICTION_ATTEMPTS {
            return;
          }
          continue;
        }
      };
      let evicted = {
        let mut inner = victim.inner.lock();
        if inner.pin_count > 0 || inner.state == EntryState::Removed {
          false
        } else {
          self.stats.eviction_started();
          inner.state = EntryState::Removed;
          inner.slot = None;
          victim.settled.notify_all();
          true
        }
      };
      if evicted {
        self.detach_entry(&victim);
        self.stats.eviction_finished();
      } else {
        // Hand the candidate back; it gets another chance once unpinned.
        self.policy.on_insert(&victim_key);
        attempts += 1;
        if attempts >= MAX_EVICTION_ATTEMPTS {
          return;
        }
      }
    }
  }

  // ---- processor support -----------------------------------------------------

  /// Snapshot of what a processor sees: the slot and modification time of a
  /// fresh entry, or nothing.
  pub(crate) fn processor_snapshot(
    &self,
    entry: &Arc<CacheEntry<K, V>>,
    prior_state: EntryState,
  ) -> (Option<ValueSlot<V>>, Option<u64>) {
    let inner = entry.inner.lock();
    let usable = prior_state == EntryState::Present && inner.is_fresh(time::now_nanos());
    if usable {
      (inner.slot.clone(), Some(inner.last_modification))
    } else {
      (None, None)
    }
  }

  /// Acquires the processor pin for `key`. Returns the guard plus whether
  /// this call created the entry.
  pub(crate) fn acquire_for_processing(
    &self,
    key: &K,
  ) -> (PinGuard<'_, K, V, H>, Arc<CacheEntry<K, V>>, EntryState) {
    loop {
      let (entry, created) = self.create_entry(key);
      if created {
        let guard = self.adopt_created(&entry, EntryState::ProcessingMutation);
        return (guard, entry, EntryState::Empty);
      }
      match self.acquire_pin(&entry, EntryState::ProcessingMutation) {
        Some(guard) => {
          let prior = guard.prior_state;
          return (guard, entry, prior);
        }
        None => {
          self.stats.gone_spin();
        }
      }
    }
  }

  /// Inline loader invocation on behalf of an entry processor. The pin is
  /// already held by the processor; no state transition happens here.
  pub(crate) fn load_for_processor(&self, key: &K) -> Option<(ValueSlot<V>, u64)> {
    let loader = self.loader.as_ref()?;
    let load_time = time::now_nanos();
    let started = Instant::now();
    let result = loader.load(key, load_time, None);
    let millis = started.elapsed().as_millis() as u64;
    match result {
      Ok(value) => {
        self.stats.load(millis);
        Some((ValueSlot::Value(Arc::new(value)), load_time))
      }
      Err(source) => {
        self.stats.load(millis);
        self.stats.load_exception();
        Some((ValueSlot::Exception(CacheError::loader(key, source)), load_time))
      }
    }
  }

  /// Applies a processor outcome and settles the pin.
  pub(crate) fn apply_processor_outcome(
    &self,
    guard: PinGuard<'_, K, V, H>,
    key: &K,
    outcome: ProcessorOutcome<V>,
    previous: Option<PreviousEntry<V>>,
  ) {
    match outcome {
      ProcessorOutcome::SetValue(value) => {
        self.stats.mutation();
        let load_time = time::now_nanos();
        let expiry_time =
          expiry::value_expiry(&self.config, key, value.as_ref(), load_time, previous.as_ref());
        self.install(guard, ValueSlot::Value(value), expiry_time, load_time, false);
      }
      ProcessorOutcome::SetException(error) => {
        self.stats.mutation();
        let load_time = time::now_nanos();
        let expiry_time = expiry::exception_expiry(&self.config, key, &error, load_time);
        self.install(guard, ValueSlot::Exception(error), expiry_time, load_time, false);
      }
      ProcessorOutcome::Remove => {
        self.stats.mutation();
        self.stats.removal();
        guard.settle(|inner| {
          inner.state = EntryState::Removed;
          inner.slot = None;
        });
      }
      ProcessorOutcome::KeepLoaded(slot, load_time) => {
        // A lazy load populated the entry even though the processor did
        // not mutate it; keep the data like any read-through would.
        let expiry_time = match &slot {
          ValueSlot::Value(value) => {
            expiry::value_expiry(&self.config, key, value.as_ref(), load_time, previous.as_ref())
          }
          ValueSlot::Exception(error) => {
            expiry::exception_expiry(&self.config, key, error, load_time)
          }
        };
        self.install(guard, slot, expiry_time, load_time, false);
      }
      ProcessorOutcome::Untouched => {
        // Abort: restores the prior state, removes a created entry.
        drop(guard);
      }
    }
  }
}

/// What an entry processor decided for its entry.
pub(crate) enum ProcessorOutcome<V> {
  SetValue(Arc<V>),
  SetException(CacheError),
  Remove,
  KeepLoaded(ValueSlot<V>, u64),
  Untouched,
}
