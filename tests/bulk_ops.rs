mod common;

use loadcache::{CacheBuilder, CompletionWaiter, LoadError};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn load_all_populates_a_fresh_cache() {
  let (cache, load_count) = common::doubling_cache();

  let waiter = CompletionWaiter::new();
  cache.load_all(vec![1, 2, 3], Some(waiter.clone()));
  waiter.await_completion().unwrap();

  assert_eq!(load_count.load(Ordering::SeqCst), 3);
  assert_eq!(cache.get(&2).unwrap(), Some(4.into()));
  // Serving the loaded keys afterwards does not load again.
  assert_eq!(load_count.load(Ordering::SeqCst), 3);
}

#[test]
fn load_all_skips_keys_that_are_already_fresh() {
  let (cache, load_count) = common::doubling_cache();

  assert_eq!(cache.get(&5).unwrap(), Some(10.into()));
  assert_eq!(load_count.load(Ordering::SeqCst), 1);

  let waiter = CompletionWaiter::new();
  cache.load_all(vec![5, 6], Some(waiter.clone()));
  waiter.await_completion().unwrap();

  assert_eq!(
    load_count.load(Ordering::SeqCst),
    2,
    "the fresh key must not be loaded again"
  );
  assert!(cache.contains_key(&6));
}

#[test]
fn reload_all_loads_unconditionally() {
  let (cache, load_count) = common::doubling_cache();

  assert_eq!(cache.get(&5).unwrap(), Some(10.into()));

  let waiter = CompletionWaiter::new();
  cache.reload_all(vec![5, 6], Some(waiter.clone()));
  waiter.await_completion().unwrap();

  assert_eq!(load_count.load(Ordering::SeqCst), 3);
  let stats = cache.statistics();
  assert_eq!(stats.loads, 2, "initial get plus the absent key");
  assert_eq!(stats.reloads, 1, "the present key was replaced");
}

#[test]
fn load_all_with_empty_key_set_completes_immediately() {
  let (cache, _load_count) = common::doubling_cache();
  let waiter = CompletionWaiter::new();
  cache.load_all(Vec::<i32>::new(), Some(waiter.clone()));
  waiter.await_completion().unwrap();
}

#[test]
fn load_all_without_loader_settles_every_key() {
  let cache = CacheBuilder::<i32, i32>::new().build().unwrap();
  let waiter = CompletionWaiter::new();
  cache.load_all(vec![1, 2, 3], Some(waiter.clone()));
  waiter.await_completion().unwrap();
  assert_eq!(cache.statistics().async_loads_started, 0);
  assert_eq!(cache.len(), 0);
}

#[test]
fn load_all_delivers_the_first_error() {
  let cache = CacheBuilder::<i32, i32>::new()
    .exception_expiry_duration(Duration::from_secs(60))
    .fallible_loader(|key: &i32| -> Result<i32, LoadError> {
      if *key == 2 {
        Err("no such row".into())
      } else {
        Ok(key * 2)
      }
    })
    .build()
    .unwrap();

  let waiter = CompletionWaiter::new();
  cache.load_all(vec![1, 2, 3], Some(waiter.clone()));
  let error = waiter.await_completion().unwrap_err();
  assert_eq!(error.key(), "2");

  // The healthy keys still landed.
  assert_eq!(cache.peek(&1).unwrap(), Some(2.into()));
  assert_eq!(cache.peek(&3).unwrap(), Some(6.into()));
}

#[test]
fn prefetch_all_only_loads_absent_keys() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new()
    .loader_thread_count(4)
    .loader({
      let load_count = load_count.clone();
      move |key: &i32| {
        load_count.fetch_add(1, Ordering::SeqCst);
        key * 2
      }
    })
    .build()
    .unwrap();

  cache.put(&1, 2);

  let waiter = CompletionWaiter::new();
  cache.prefetch_all(vec![1, 2, 3], Some(waiter.clone()));
  waiter.await_completion().unwrap();

  assert_eq!(load_count.load(Ordering::SeqCst), 2);
  assert!(cache.contains_key(&2));
  assert!(cache.contains_key(&3));
  assert_eq!(
    cache.statistics().async_loads_started,
    2,
    "only the absent keys were dispatched"
  );
}

#[test]
fn prefetch_of_a_present_key_is_a_noop() {
  let (cache, load_count) = common::doubling_cache();
  cache.put(&123, 246);
  cache.prefetch(&123);

  // Nothing to wait on; give a potential stray dispatch time to surface.
  thread::sleep(Duration::from_millis(50));
  assert_eq!(load_count.load(Ordering::SeqCst), 0);
  assert_eq!(cache.statistics().async_loads_started, 0);
}

#[test]
fn saturated_pool_runs_loads_on_the_submitting_thread() {
  let release = Arc::new(AtomicBool::new(false));
  let main_thread = thread::current().id();
  let caller_ran_on_main = Arc::new(AtomicBool::new(false));

  let cache = Arc::new(
    CacheBuilder::new()
      .loader_thread_count(1)
      .loader({
        let release = release.clone();
        let caller_ran_on_main = caller_ran_on_main.clone();
        move |key: &i32| {
          if *key == 1 {
            // Occupy the single worker until released.
            while !release.load(Ordering::Acquire) {
              thread::sleep(Duration::from_millis(1));
            }
          } else if thread::current().id() == main_thread {
            caller_ran_on_main.store(true, Ordering::Release);
          }
          key * 2
        }
      })
      .build()
      .unwrap(),
  );

  // Occupies the only pool worker.
  cache.load_all(vec![1], None);
  assert!(
    common::wait_until(Duration::from_secs(2), || {
      cache.statistics().async_loads_in_flight == 1
    }),
    "the blocking load never reached the pool"
  );

  // Saturated: this load must run inline on the submitting thread.
  let waiter = CompletionWaiter::new();
  cache.load_all(vec![2], Some(waiter.clone()));
  waiter.await_completion().unwrap();
  assert!(caller_ran_on_main.load(Ordering::Acquire));
  assert_eq!(cache.get(&2).unwrap(), Some(4.into()));

  release.store(true, Ordering::Release);
  assert!(common::wait_until(Duration::from_secs(2), || {
    cache.contains_key(&1)
  }));

  let stats = cache.statistics();
  assert_eq!(stats.async_loads_started, 1);
  assert_eq!(stats.caller_runs, 1);
}

#[test]
fn saturated_prefetch_is_dropped_not_run() {
  let release = Arc::new(AtomicBool::new(false));
  let load_count = Arc::new(AtomicUsize::new(0));

  let cache = Arc::new(
    CacheBuilder::new()
      .loader_thread_count(1)
      .loader({
        let release = release.clone();
        let load_count = load_count.clone();
        move |key: &i32| {
          load_count.fetch_add(1, Ordering::SeqCst);
          if *key == 1 {
            while !release.load(Ordering::Acquire) {
              thread::sleep(Duration::from_millis(1));
            }
          }
          key * 2
        }
      })
      .build()
      .unwrap(),
  );

  cache.load_all(vec![1], None);
  assert!(common::wait_until(Duration::from_secs(2), || {
    cache.statistics().async_loads_in_flight == 1
  }));

  // The pool is saturated; the hint settles without loading.
  let waiter = CompletionWaiter::new();
  cache.prefetch_all(vec![2], Some(waiter.clone()));
  waiter.await_completion().unwrap();
  assert!(!cache.contains_key(&2));

  release.store(true, Ordering::Release);
  assert!(common::wait_until(Duration::from_secs(2), || {
    cache.contains_key(&1)
  }));
  assert_eq!(load_count.load(Ordering::SeqCst), 1, "only key 1 loaded");
}
