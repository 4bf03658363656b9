use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// The full counter set backing an enabled cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub(crate) struct CounterSet {
  // --- Hit/Miss ---
  hits: CachePadded<AtomicU64>,
  misses: CachePadded<AtomicU64>,

  // --- Reads that bypass the loader ---
  peek_misses: CachePadded<AtomicU64>,
  peek_hits_not_fresh: CachePadded<AtomicU64>,

  // --- Loader activity ---
  loads: CachePadded<AtomicU64>,
  reloads: CachePadded<AtomicU64>,
  refreshes: CachePadded<AtomicU64>,
  refresh_hits: CachePadded<AtomicU64>,
  refresh_submit_failed: CachePadded<AtomicU64>,
  load_millis: CachePadded<AtomicU64>,
  load_exceptions: CachePadded<AtomicU64>,
  suppressed_exceptions: CachePadded<AtomicU64>,

  // --- Background dispatch ---
  async_loads_started: CachePadded<AtomicU64>,
  async_loads_in_flight: CachePadded<AtomicU64>,
  caller_runs: CachePadded<AtomicU64>,

  // --- Mutations ---
  put_new_entries: CachePadded<AtomicU64>,
  put_hits: CachePadded<AtomicU64>,
  mutations: CachePadded<AtomicU64>,
  removals: CachePadded<AtomicU64>,
  clears: CachePadded<AtomicU64>,
  cleared_entries: CachePadded<AtomicU64>,

  // --- Lifecycle ---
  evictions: CachePadded<AtomicU64>,
  eviction_running: CachePadded<AtomicU64>,
  expired_kept: CachePadded<AtomicU64>,
  timer_events: CachePadded<AtomicU64>,
  gone_spins: CachePadded<AtomicU64>,

  // --- Anomalies ---
  internal_exceptions: CachePadded<AtomicU64>,
  keys_mutated: CachePadded<AtomicU64>,

  created_at: Instant,
}

// Manual implementation of Default to handle the non-default `Instant`.
impl Default for CounterSet {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      peek_misses: CachePadded::new(AtomicU64::new(0)),
      peek_hits_not_fresh: CachePadded::new(AtomicU64::new(0)),
      loads: CachePadded::new(AtomicU64::new(0)),
      reloads: CachePadded::new(AtomicU64::new(0)),
      refreshes: CachePadded::new(AtomicU64::new(0)),
      refresh_hits: CachePadded::new(AtomicU64::new(0)),
      refresh_submit_failed: CachePadded::new(AtomicU64::new(0)),
      load_millis: CachePadded::new(AtomicU64::new(0)),
      load_exceptions: CachePadded::new(AtomicU64::new(0)),
      suppressed_exceptions: CachePadded::new(AtomicU64::new(0)),
      async_loads_started: CachePadded::new(AtomicU64::new(0)),
      async_loads_in_flight: CachePadded::new(AtomicU64::new(0)),
      caller_runs: CachePadded::new(AtomicU64::new(0)),
      put_new_entries: CachePadded::new(AtomicU64::new(0)),
      put_hits: CachePadded::new(AtomicU64::new(0)),
      mutations: CachePadded::new(AtomicU64::new(0)),
      removals: CachePadded::new(AtomicU64::new(0)),
      clears: CachePadded::new(AtomicU64::new(0)),
      cleared_entries: CachePadded::new(AtomicU64::new(0)),
      evictions: CachePadded::new(AtomicU64::new(0)),
      eviction_running: CachePadded::new(AtomicU64::new(0)),
      expired_kept: CachePadded::new(AtomicU64::new(0)),
      timer_events: CachePadded::new(AtomicU64::new(0)),
      gone_spins: CachePadded::new(AtomicU64::new(0)),
      internal_exceptions: CachePadded::new(AtomicU64::new(0)),
      keys_mutated: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

macro_rules! count {
  ($self:ident, $field:ident) => {
    if let StatCounters::Enabled(c) = $self {
      c.$field.fetch_add(1, Ordering::Relaxed);
    }
  };
  ($self:ident, $field:ident, $amount:expr) => {
    if let StatCounters::Enabled(c) = $self {
      c.$field.fetch_add($amount, Ordering::Relaxed);
    }
  };
}

/// Statistics recorder. The `Disabled` variant turns every update into a
/// no-op so a cache built with statistics off pays nothing per operation.
#[derive(Debug)]
pub(crate) enum StatCounters {
  Enabled(Box<CounterSet>),
  Disabled { created_at: Instant },
}

impl StatCounters {
  pub(crate) fn new(enabled: bool) -> Self {
    if enabled {
      StatCounters::Enabled(Box::new(CounterSet::default()))
    } else {
      StatCounters::Disabled { created_at: Instant::now() }
    }
  }

  #[inline]
  pub(crate) fn hit(&self) {
    count!(self, hits);
  }

  #[inline]
  pub(crate) fn miss(&self) {
    count!(self, misses);
  }

  #[inline]
  pub(crate) fn peek_miss(&self) {
    count!(self, peek_misses);
  }

  #[inline]
  pub(crate) fn peek_hit_not_fresh(&self) {
    count!(self, peek_hits_not_fresh);
  }

  #[inline]
  pub(crate) fn load(&self, millis: u64) {
    count!(self, loads);
    count!(self, load_millis, millis);
  }

  #[inline]
  pub(crate) fn reload(&self, millis: u64) {
    count!(self, reloads);
    count!(self, load_millis, millis);
  }

  #[inline]
  pub(crate) fn refresh(&self, millis: u64) {
    count!(self, refreshes);
    count!(self, load_millis, millis);
  }

  #[inline]
  pub(crate) fn refresh_hit(&self) {
    count!(self, refresh_hits);
  }

  #[inline]
  pub(crate) fn refresh_submit_failed(&self) {
    count!(self, refresh_submit_failed);
  }

  #[inline]
  pub(crate) fn load_exception(&self) {
    count!(self, load_exceptions);
  }

  #[inline]
  pub(crate) fn suppressed_exception(&self) {
    count!(self, suppressed_exceptions);
  }

  #[inline]
  pub(crate) fn async_load_started(&self) {
    count!(self, async_loads_started);
  }

  /// A dispatched load began executing on a pool worker.
  #[inline]
  pub(crate) fn async_load_entered(&self) {
    count!(self, async_loads_in_flight);
  }

  #[inline]
  pub(crate) fn async_load_exited(&self) {
    if let StatCounters::Enabled(c) = self {
      c.async_loads_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
  }

  #[inline]
  pub(crate) fn caller_run(&self) {
    count!(self, caller_runs);
  }

  #[inline]
  pub(crate) fn put_new_entry(&self) {
    count!(self, put_new_entries);
  }

  #[inline]
  pub(crate) fn put_hit(&self) {
    count!(self, put_hits);
  }

  #[inline]
  pub(crate) fn mutation(&self) {
    count!(self, mutations);
  }

  #[inline]
  pub(crate) fn removal(&self) {
    count!(self, removals);
  }

  #[inline]
  pub(crate) fn clear_op(&self, entries: u64) {
    count!(self, clears);
    count!(self, cleared_entries, entries);
  }

  #[inline]
  pub(crate) fn eviction_started(&self) {
    count!(self, eviction_running);
  }

  #[inline]
  pub(crate) fn eviction_finished(&self) {
    if let StatCounters::Enabled(c) = self {
      c.eviction_running.fetch_sub(1, Ordering::Relaxed);
      c.evictions.fetch_add(1, Ordering::Relaxed);
    }
  }

  #[inline]
  pub(crate) fn expired_kept(&self) {
    count!(self, expired_kept);
  }

  #[inline]
  pub(crate) fn timer_event(&self) {
    count!(self, timer_events);
  }

  #[inline]
  pub(crate) fn gone_spin(&self) {
    count!(self, gone_spins);
  }

  #[inline]
  pub(crate) fn internal_exception(&self) {
    count!(self, internal_exceptions);
  }

  #[inline]
  pub(crate) fn key_mutated(&self) {
    count!(self, keys_mutated);
  }

  /// Creates a point-in-time snapshot. Store-level fields are filled in by
  /// the cache handle.
  pub(crate) fn snapshot(&self) -> StatisticsSnapshot {
    match self {
      StatCounters::Disabled { created_at } => StatisticsSnapshot {
        uptime_secs: created_at.elapsed().as_secs(),
        ..StatisticsSnapshot::zeroed()
      },
      StatCounters::Enabled(c) => {
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let total_reads = hits + misses;

        StatisticsSnapshot {
          hits,
          misses,
          hit_ratio: if total_reads == 0 {
            0.0
          } else {
            hits as f64 / total_reads as f64
          },
          peek_misses: c.peek_misses.load(Ordering::Relaxed),
          peek_hits_not_fresh: c.peek_hits_not_fresh.load(Ordering::Relaxed),
          loads: c.loads.load(Ordering::Relaxed),
          reloads: c.reloads.load(Ordering::Relaxed),
          refreshes: c.refreshes.load(Ordering::Relaxed),
          refresh_hits: c.refresh_hits.load(Ordering::Relaxed),
          refresh_submit_failed: c.refresh_submit_failed.load(Ordering::Relaxed),
          load_millis: c.load_millis.load(Ordering::Relaxed),
          load_exceptions: c.load_exceptions.load(Ordering::Relaxed),
          suppressed_exceptions: c.suppressed_exceptions.load(Ordering::Relaxed),
          async_loads_started: c.async_loads_started.load(Ordering::Relaxed),
          async_loads_in_flight: c.async_loads_in_flight.load(Ordering::Relaxed),
          caller_runs: c.caller_runs.load(Ordering::Relaxed),
          put_new_entries: c.put_new_entries.load(Ordering::Relaxed),
          put_hits: c.put_hits.load(Ordering::Relaxed),
          mutations: c.mutations.load(Ordering::Relaxed),
          removals: c.removals.load(Ordering::Relaxed),
          clears: c.clears.load(Ordering::Relaxed),
          cleared_entries: c.cleared_entries.load(Ordering::Relaxed),
          evictions: c.evictions.load(Ordering::Relaxed),
          eviction_running: c.eviction_running.load(Ordering::Relaxed),
          expired_kept: c.expired_kept.load(Ordering::Relaxed),
          timer_events: c.timer_events.load(Ordering::Relaxed),
          gone_spins: c.gone_spins.load(Ordering::Relaxed),
          internal_exceptions: c.internal_exceptions.load(Ordering::Relaxed),
          keys_mutated: c.keys_mutated.load(Ordering::Relaxed),
          entry_count: 0,
          longest_slot: 0,
          collision_percentage: 0,
          uptime_secs: c.created_at.elapsed().as_secs(),
        }
      }
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's statistics.
#[derive(Clone)]
pub struct StatisticsSnapshot {
  /// Reads answered from a fresh entry.
  pub hits: u64,
  /// Reads that found no usable entry.
  pub misses: u64,
  /// hits / (hits + misses).
  pub hit_ratio: f64,
  /// Peeks that found no entry at all.
  pub peek_misses: u64,
  /// Peeks that found an entry whose data was no longer fresh.
  pub peek_hits_not_fresh: u64,
  /// Loader invocations for absent entries.
  pub loads: u64,
  /// Loader invocations replacing existing data.
  pub reloads: u64,
  /// Loader invocations issued by refresh-ahead.
  pub refreshes: u64,
  /// Accesses that hit a refreshed entry during its probation window.
  pub refresh_hits: u64,
  /// Refresh attempts that could not be handed to the loader pool.
  pub refresh_submit_failed: u64,
  /// Accumulated wall-clock milliseconds spent inside the loader.
  pub load_millis: u64,
  /// Loader invocations that returned an error.
  pub load_exceptions: u64,
  /// Loader errors that were suppressed in favor of the previous value.
  pub suppressed_exceptions: u64,
  /// Loads handed to a pool worker.
  pub async_loads_started: u64,
  /// Pool loads currently executing.
  pub async_loads_in_flight: u64,
  /// Loads executed on the submitting thread because the pool was saturated.
  pub caller_runs: u64,
  /// Puts that created a new entry.
  pub put_new_entries: u64,
  /// Puts that replaced existing data.
  pub put_hits: u64,
  /// Entry-processor invocations that mutated the entry.
  pub mutations: u64,
  /// Explicit removals.
  pub removals: u64,
  /// Number of `clear` calls.
  pub clears: u64,
  /// Entries discarded by `clear` calls.
  pub cleared_entries: u64,
  /// Entries evicted to honor the capacity bound.
  pub evictions: u64,
  /// Evictions currently in progress.
  pub eviction_running: u64,
  /// Entries that expired with their data retained.
  pub expired_kept: u64,
  /// Timer events processed by the expiry driver.
  pub timer_events: u64,
  /// Operations that raced entry removal and retried.
  pub gone_spins: u64,
  /// Internal bookkeeping anomalies. Always zero in a healthy cache.
  pub internal_exceptions: u64,
  /// Entries whose key hash changed after insertion.
  pub keys_mutated: u64,
  /// Current number of entries, including non-fresh ones.
  pub entry_count: u64,
  /// Entry count of the most populated store slot.
  pub longest_slot: u64,
  /// Percentage of entries sharing a store slot with another entry.
  pub collision_percentage: u32,
  /// Seconds since the cache was built.
  pub uptime_secs: u64,
}

impl StatisticsSnapshot {
  fn zeroed() -> Self {
    StatisticsSnapshot {
      hits: 0,
      misses: 0,
      hit_ratio: 0.0,
      peek_misses: 0,
      peek_hits_not_fresh: 0,
      loads: 0,
      reloads: 0,
      refreshes: 0,
      refresh_hits: 0,
      refresh_submit_failed: 0,
      load_millis: 0,
      load_exceptions: 0,
      suppressed_exceptions: 0,
      async_loads_started: 0,
      async_loads_in_flight: 0,
      caller_runs: 0,
      put_new_entries: 0,
      put_hits: 0,
      mutations: 0,
      removals: 0,
      clears: 0,
      cleared_entries: 0,
      evictions: 0,
      eviction_running: 0,
      expired_kept: 0,
      timer_events: 0,
      gone_spins: 0,
      internal_exceptions: 0,
      keys_mutated: 0,
      entry_count: 0,
      longest_slot: 0,
      collision_percentage: 0,
      uptime_secs: 0,
    }
  }
}

impl fmt::Debug for StatisticsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StatisticsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("loads", &self.loads)
      .field("reloads", &self.reloads)
      .field("refreshes", &self.refreshes)
      .field("load_exceptions", &self.load_exceptions)
      .field("suppressed_exceptions", &self.suppressed_exceptions)
      .field("async_loads_started", &self.async_loads_started)
      .field("caller_runs", &self.caller_runs)
      .field("put_new_entries", &self.put_new_entries)
      .field("put_hits", &self.put_hits)
      .field("removals", &self.removals)
      .field("evictions", &self.evictions)
      .field("expired_kept", &self.expired_kept)
      .field("timer_events", &self.timer_events)
      .field("gone_spins", &self.gone_spins)
      .field("internal_exceptions", &self.internal_exceptions)
      .field("keys_mutated", &self.keys_mutated)
      .field("entry_count", &self.entry_count)
      .field("longest_slot", &self.longest_slot)
      .field("collision_percentage", &self.collision_percentage)
      .field("uptime_secs", &self.uptime_secs)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disabled_counters_read_zero() {
    let stats = StatCounters::new(false);
    stats.hit();
    stats.miss();
    stats.load(12);
    let snap = stats.snapshot();
    assert_eq!(snap.hits, 0);
    assert_eq!(snap.misses, 0);
    assert_eq!(snap.loads, 0);
    assert_eq!(snap.load_millis, 0);
  }

  #[test]
  fn hit_ratio_is_derived() {
    let stats = StatCounters::new(true);
    stats.hit();
    stats.hit();
    stats.hit();
    stats.miss();
    let snap = stats.snapshot();
    assert_eq!(snap.hits, 3);
    assert_eq!(snap.misses, 1);
    assert!((snap.hit_ratio - 0.75).abs() < f64::EPSILON);
  }

  #[test]
  fn gauges_go_up_and_down() {
    let stats = StatCounters::new(true);
    stats.async_load_entered();
    stats.async_load_entered();
    stats.async_load_exited();
    assert_eq!(stats.snapshot().async_loads_in_flight, 1);

    stats.eviction_started();
    stats.eviction_finished();
    let snap = stats.snapshot();
    assert_eq!(snap.eviction_running, 0);
    assert_eq!(snap.evictions, 1);
  }
}
