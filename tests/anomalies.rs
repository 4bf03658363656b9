mod common;

use loadcache::CacheBuilder;

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A key whose hash can change after insertion. Hashing a mutable key is a
/// contract violation on the caller's side; the cache detects it instead of
/// misbehaving.
#[derive(Clone, Debug)]
struct VolatileKey(Arc<AtomicU64>);

impl VolatileKey {
  fn new(id: u64) -> Self {
    VolatileKey(Arc::new(AtomicU64::new(id)))
  }
}

impl PartialEq for VolatileKey {
  fn eq(&self, other: &Self) -> bool {
    self.0.load(Ordering::SeqCst) == other.0.load(Ordering::SeqCst)
  }
}

impl Eq for VolatileKey {}

impl Hash for VolatileKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.0.load(Ordering::SeqCst).hash(state);
  }
}

#[test]
fn key_mutated_after_insertion_is_counted_and_abandoned() {
  let cache = CacheBuilder::<VolatileKey, i32>::new()
    .expiry_duration(Duration::ZERO)
    .loader(|key: &VolatileKey| {
      // The stored key shares this counter, so its hash changes underneath
      // the cache while the entry is live.
      key.0.fetch_add(1, Ordering::SeqCst);
      42
    })
    .build()
    .unwrap();

  let key = VolatileKey::new(7);
  assert_eq!(cache.get(&key).unwrap(), Some(42.into()));

  // The zero-expiry removal no longer finds the mapping under the recorded
  // hash. The anomaly is counted and the mapping abandoned, not corrected.
  let stats = cache.statistics();
  assert_eq!(stats.keys_mutated, 1);
  assert_eq!(cache.len(), 1, "the orphaned mapping stays in the store");
}

#[test]
fn a_waiter_behind_an_uncacheable_load_retries() {
  let started = Arc::new(AtomicBool::new(false));
  let cache = Arc::new(
    CacheBuilder::new()
      .expiry_duration(Duration::ZERO)
      .loader({
        let started = started.clone();
        move |key: &i32| {
          started.store(true, Ordering::SeqCst);
          thread::sleep(Duration::from_millis(150));
          key * 2
        }
      })
      .build()
      .unwrap(),
  );

  // The leader's result is not cacheable, so the entry it parked on is gone
  // by the time the waiter wakes; the waiter retries with its own load.
  let leader = {
    let cache = cache.clone();
    thread::spawn(move || {
      assert_eq!(cache.get(&1).unwrap(), Some(2.into()));
    })
  };
  assert!(common::wait_until(Duration::from_secs(2), || {
    started.load(Ordering::SeqCst)
  }));
  assert_eq!(cache.get(&1).unwrap(), Some(2.into()));
  leader.join().unwrap();

  let stats = cache.statistics();
  assert!(stats.gone_spins >= 1, "the waiter re-examined a removed entry");
  assert_eq!(stats.loads, 2);
}
