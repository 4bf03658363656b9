#![allow(dead_code)]

use loadcache::{Cache, CacheBuilder};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A cache whose loader returns `key * 2` and counts its invocations.
pub fn doubling_cache() -> (Cache<i32, i32>, Arc<AtomicUsize>) {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new()
    .name("doubling")
    .loader({
      let load_count = load_count.clone();
      move |key: &i32| {
        load_count.fetch_add(1, Ordering::SeqCst);
        key * 2
      }
    })
    .build()
    .unwrap();
  (cache, load_count)
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
  let deadline = std::time::Instant::now() + timeout;
  while std::time::Instant::now() < deadline {
    if predicate() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  predicate()
}
