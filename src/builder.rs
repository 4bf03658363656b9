//! Fluent cache construction.

use crate::config::{CacheConfig, ExceptionExpiryCalculator, ExpiryCalculator};
use crate::error::{BuildError, LoadError};
use crate::handle::Cache;
use crate::loader::{AdvancedLoader, Loader};
use crate::metrics::StatCounters;
use crate::policy::{ClockPolicy, EvictionPolicy};
use crate::pool::LoaderPool;
use crate::shared::CacheShared;
use crate::store::EntryStore;
use crate::task::timer::{ExpiryDriver, TimerWheel};

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

const DEFAULT_TIMER_TICK: Duration = Duration::from_millis(100);
const DEFAULT_TIMER_WHEEL_SIZE: usize = 512;

/// Builds a [`Cache`].
///
/// ```
/// use loadcache::CacheBuilder;
///
/// let cache = CacheBuilder::<u32, String>::new()
///   .name("user-names")
///   .entry_capacity(10_000)
///   .loader(|id| format!("user-{id}"))
///   .build()
///   .unwrap();
///
/// assert_eq!(cache.get(&42).unwrap().as_deref(), Some(&"user-42".to_string()));
/// ```
pub struct CacheBuilder<K: Send, V: Send + Sync, H = ahash::RandomState> {
  name: Option<String>,
  entry_capacity: u64,
  shards: usize,
  eternal: bool,
  expiry: Option<Duration>,
  exception_expiry: Option<Duration>,
  refresh_ahead: bool,
  sharp_expiry: bool,
  keep_data_after_expired: bool,
  suppress_exceptions: bool,
  statistics: bool,
  loader: Option<Loader<K, V>>,
  loader_thread_count: usize,
  prefetch_thread_count: Option<usize>,
  policy: Option<Box<dyn EvictionPolicy<K>>>,
  expiry_calculator: Option<ExpiryCalculator<K, V>>,
  exception_expiry_calculator: Option<ExceptionExpiryCalculator<K>>,
  timer_tick: Duration,
  timer_wheel_size: usize,
  hasher: H,
}

impl<K, V> CacheBuilder<K, V, ahash::RandomState>
where
  K: Send,
  V: Send + Sync,
{
  pub fn new() -> Self {
    Self::with_hasher(ahash::RandomState::new())
  }
}

impl<K, V> Default for CacheBuilder<K, V, ahash::RandomState>
where
  K: Send,
  V: Send + Sync,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Send,
  V: Send + Sync,
{
  /// Starts a builder with an explicit hasher.
  pub fn with_hasher(hasher: H) -> Self {
    Self {
      name: None,
      entry_capacity: u64::MAX,
      shards: (num_cpus::get() * 4).next_power_of_two(),
      eternal: false,
      expiry: None,
      exception_expiry: None,
      refresh_ahead: false,
      sharp_expiry: false,
      keep_data_after_expired: false,
      suppress_exceptions: true,
      statistics: true,
      loader: None,
      loader_thread_count: num_cpus::get().max(1),
      prefetch_thread_count: None,
      policy: None,
      expiry_calculator: None,
      exception_expiry_calculator: None,
      timer_tick: DEFAULT_TIMER_TICK,
      timer_wheel_size: DEFAULT_TIMER_WHEEL_SIZE,
      hasher,
    }
  }

  /// Names the cache for log messages and diagnostics.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Bounds the cache to `capacity` entries. Exceeding the bound evicts.
  pub fn entry_capacity(mut self, capacity: u64) -> Self {
    self.entry_capacity = capacity;
    self
  }

  /// Removes the capacity bound. This is the default.
  pub fn unbounded(mut self) -> Self {
    self.entry_capacity = u64::MAX;
    self
  }

  /// Number of store shards, rounded up to a power of two.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards.next_power_of_two();
    self
  }

  /// Declares values immutable once loaded: no expiry, no refresh, and
  /// loader errors are not retained.
  pub fn eternal(mut self, eternal: bool) -> Self {
    self.eternal = eternal;
    self
  }

  /// Values stop being served `duration` after load. Zero means loaded
  /// values are never served from cache, which still collapses concurrent
  /// loads per key.
  pub fn expiry_duration(mut self, duration: Duration) -> Self {
    self.expiry = Some(duration);
    self
  }

  /// How long a loader error is cached before the load is retried.
  /// Defaults to a tenth of the value expiry.
  pub fn exception_expiry_duration(mut self, duration: Duration) -> Self {
    self.exception_expiry = Some(duration);
    self
  }

  /// Per-value expiry. A configured `expiry_duration` caps the result.
  pub fn expiry_calculator(mut self, calculator: ExpiryCalculator<K, V>) -> Self {
    self.expiry_calculator = Some(calculator);
    self
  }

  pub fn exception_expiry_calculator(
    mut self,
    calculator: ExceptionExpiryCalculator<K>,
  ) -> Self {
    self.exception_expiry_calculator = Some(calculator);
    self
  }

  /// Reload entries just before they expire instead of dropping them, as
  /// long as they keep being accessed. Requires a loader.
  pub fn refresh_ahead(mut self, refresh_ahead: bool) -> Self {
    self.refresh_ahead = refresh_ahead;
    self
  }

  /// Enforce expiry on the timer instead of lazily on access.
  pub fn sharp_expiry(mut self, sharp_expiry: bool) -> Self {
    self.sharp_expiry = sharp_expiry;
    self
  }

  /// Keep expired data in the entry for loaders that want the previous
  /// value.
  pub fn keep_data_after_expired(mut self, keep: bool) -> Self {
    self.keep_data_after_expired = keep;
    self
  }

  /// When a reload fails but a previous value exists, keep serving that
  /// value instead of surfacing the error. Defaults to `true`.
  pub fn suppress_exceptions(mut self, suppress: bool) -> Self {
    self.suppress_exceptions = suppress;
    self
  }

  /// Turns every statistics update into a no-op.
  pub fn disable_statistics(mut self) -> Self {
    self.statistics = false;
    self
  }

  /// An infallible loader closure.
  pub fn loader<F>(mut self, loader: F) -> Self
  where
    F: Fn(&K) -> V + Send + Sync + 'static,
  {
    self.loader = Some(Loader::Simple(Arc::new(loader)));
    self
  }

  /// A loader closure that can fail. Failures are cached and rethrown.
  pub fn fallible_loader<F>(mut self, loader: F) -> Self
  where
    F: Fn(&K) -> Result<V, LoadError> + Send + Sync + 'static,
  {
    self.loader = Some(Loader::Fallible(Arc::new(loader)));
    self
  }

  /// A loader receiving the load time and the previous entry on reloads.
  pub fn advanced_loader<L>(mut self, loader: L) -> Self
  where
    L: AdvancedLoader<K, V> + 'static,
  {
    self.loader = Some(Loader::Advanced(Arc::new(loader)));
    self
  }

  /// Worker threads for `load_all`/`reload_all` and refresh-ahead.
  /// Defaults to the number of CPUs. Saturation runs loads on the
  /// submitting thread.
  pub fn loader_thread_count(mut self, threads: usize) -> Self {
    self.loader_thread_count = threads;
    self
  }

  /// A separate pool for prefetching; by default prefetch shares the
  /// loader pool.
  pub fn prefetch_thread_count(mut self, threads: usize) -> Self {
    self.prefetch_thread_count = Some(threads);
    self
  }

  /// Replaces the default Clock eviction policy.
  pub fn eviction_policy(mut self, policy: Box<dyn EvictionPolicy<K>>) -> Self {
    self.policy = Some(policy);
    self
  }

  /// Granularity of sharp-expiry and refresh-ahead timers.
  pub fn timer_tick_duration(mut self, tick: Duration) -> Self {
    self.timer_tick = tick;
    self
  }

  pub fn timer_wheel_size(mut self, size: usize) -> Self {
    self.timer_wheel_size = size;
    self
  }

  fn validate(&self) -> Result<(), BuildError> {
    if self.entry_capacity == 0 {
      return Err(BuildError::ZeroCapacity);
    }
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if self.refresh_ahead && self.loader.is_none() {
      return Err(BuildError::RefreshAheadWithoutLoader);
    }
    if self.loader_thread_count == 0 {
      return Err(BuildError::ZeroLoaderThreads);
    }
    if self.prefetch_thread_count == Some(0) {
      return Err(BuildError::ZeroPrefetchThreads);
    }
    if self.timer_wheel_size == 0 {
      return Err(BuildError::ZeroTimerWheelSize);
    }
    Ok(())
  }
}

impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub fn build(mut self) -> Result<Cache<K, V, H>, BuildError> {
    self.validate()?;

    let config = CacheConfig {
      name: self.name.take().unwrap_or_else(|| "loadcache".into()),
      entry_capacity: self.entry_capacity,
      eternal: self.eternal,
      expiry: self.expiry,
      exception_expiry: self.exception_expiry,
      refresh_ahead: self.refresh_ahead,
      sharp_expiry: self.sharp_expiry,
      keep_data_after_expired: self.keep_data_after_expired,
      suppress_exceptions: self.suppress_exceptions,
      expiry_calculator: self.expiry_calculator.take(),
      exception_expiry_calculator: self.exception_expiry_calculator.take(),
    };

    let store = EntryStore::new(self.shards, self.hasher.clone());
    let stats = StatCounters::new(self.statistics);
    let policy = self
      .policy
      .take()
      .unwrap_or_else(|| Box::new(ClockPolicy::new()));

    let loader = self.loader.take();
    let loader_pool = loader
      .as_ref()
      .map(|_| Arc::new(LoaderPool::new(self.loader_thread_count, "loadcache-loader")));
    let prefetch_pool = match (&loader, self.prefetch_thread_count) {
      (Some(_), Some(threads)) => {
        Some(Arc::new(LoaderPool::new(threads, "loadcache-prefetch")))
      }
      (Some(_), None) => loader_pool.clone(),
      (None, _) => None,
    };

    // Timers only exist for the proactive expiry modes; lazy expiry is
    // checked on access alone.
    let timer_wheel = if self.sharp_expiry || self.refresh_ahead {
      Some(TimerWheel::new(self.timer_wheel_size, self.timer_tick))
    } else {
      None
    };

    let shared = Arc::new(CacheShared {
      config,
      store,
      stats,
      policy,
      loader,
      loader_pool,
      prefetch_pool,
      timer_wheel,
      expiry_driver: Mutex::new(None),
    });

    if let Some(wheel) = shared.timer_wheel() {
      let driver = ExpiryDriver::spawn(Arc::downgrade(&shared), wheel.tick_duration());
      *shared.expiry_driver.lock() = Some(driver);
    }

    Ok(Cache::from_shared(shared))
  }
}
