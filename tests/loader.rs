mod common;

use loadcache::{AdvancedLoader, CacheBuilder, LoadError, PreviousEntry};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn loader_runs_on_miss_and_result_is_cached() {
  let (cache, load_count) = common::doubling_cache();

  assert_eq!(cache.get(&5).unwrap(), Some(10.into()));
  assert_eq!(load_count.load(Ordering::SeqCst), 1, "loader called once");

  // Only the accessed key exists.
  assert!(cache.contains_key(&5));
  assert!(!cache.contains_key(&2));

  // Second get is a hit and does not call the loader.
  assert_eq!(cache.get(&5).unwrap(), Some(10.into()));
  assert_eq!(load_count.load(Ordering::SeqCst), 1);

  let stats = cache.statistics();
  assert_eq!(stats.misses, 1);
  assert_eq!(stats.hits, 1);
  assert_eq!(stats.loads, 1);
}

#[test]
fn thundering_herd_collapses_onto_one_load() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let num_threads = 20;

  let cache = Arc::new(
    CacheBuilder::new()
      .loader({
        let load_count = load_count.clone();
        move |key: &i32| {
          // Simulate a slow database call.
          thread::sleep(Duration::from_millis(100));
          load_count.fetch_add(1, Ordering::SeqCst);
          key * 10
        }
      })
      .build()
      .unwrap(),
  );

  let barrier = Arc::new(Barrier::new(num_threads));
  let mut handles = vec![];
  for _ in 0..num_threads {
    let cache = cache.clone();
    let barrier = barrier.clone();
    handles.push(thread::spawn(move || {
      barrier.wait();
      // All threads request the same missing key at once.
      assert_eq!(cache.get(&99).unwrap(), Some(990.into()));
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(
    load_count.load(Ordering::SeqCst),
    1,
    "load collapsing failed: loader was called more than once"
  );
  let stats = cache.statistics();
  assert_eq!(stats.misses, 1, "only the leader misses");
  assert_eq!(stats.hits, (num_threads - 1) as u64);
}

#[test]
fn loader_errors_are_cached_and_rethrown() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<i32, i32>::new()
    .exception_expiry_duration(Duration::from_secs(60))
    .fallible_loader({
      let load_count = load_count.clone();
      move |_key: &i32| -> Result<i32, LoadError> {
        load_count.fetch_add(1, Ordering::SeqCst);
        Err("backend unavailable".into())
      }
    })
    .build()
    .unwrap();

  let error = cache.get(&1).unwrap_err();
  assert_eq!(error.key(), "1");
  assert_eq!(load_count.load(Ordering::SeqCst), 1);

  // The failure is served from cache within the exception expiry.
  let error = cache.get(&1).unwrap_err();
  assert_eq!(error.key(), "1");
  assert_eq!(load_count.load(Ordering::SeqCst), 1);

  let stats = cache.statistics();
  assert_eq!(stats.load_exceptions, 1);
}

#[test]
fn suppressed_exception_keeps_serving_the_old_value() {
  let fail = Arc::new(AtomicBool::new(false));
  let cache = CacheBuilder::<i32, i32>::new()
    // The retry window also bounds how long the suppressed value is kept.
    .exception_expiry_duration(Duration::from_secs(60))
    .fallible_loader({
      let fail = fail.clone();
      move |key: &i32| -> Result<i32, LoadError> {
        if fail.load(Ordering::SeqCst) {
          Err("flaky backend".into())
        } else {
          Ok(key * 2)
        }
      }
    })
    .build()
    .unwrap();

  assert_eq!(cache.get(&4).unwrap(), Some(8.into()));

  // Force a reload that fails; suppression is on by default.
  fail.store(true, Ordering::SeqCst);
  let waiter = loadcache::CompletionWaiter::new();
  cache.reload_all(vec![4], Some(waiter.clone()));
  waiter.await_completion().unwrap();

  assert_eq!(cache.get(&4).unwrap(), Some(8.into()), "old value survives");
  let stats = cache.statistics();
  assert_eq!(stats.suppressed_exceptions, 1);
  assert_eq!(stats.load_exceptions, 1);
}

#[test]
fn unsuppressed_reload_error_replaces_the_value() {
  let fail = Arc::new(AtomicBool::new(false));
  let cache = CacheBuilder::<i32, i32>::new()
    .suppress_exceptions(false)
    .exception_expiry_duration(Duration::from_secs(60))
    .fallible_loader({
      let fail = fail.clone();
      move |key: &i32| -> Result<i32, LoadError> {
        if fail.load(Ordering::SeqCst) {
          Err("flaky backend".into())
        } else {
          Ok(key * 2)
        }
      }
    })
    .build()
    .unwrap();

  assert_eq!(cache.get(&4).unwrap(), Some(8.into()));
  fail.store(true, Ordering::SeqCst);

  let waiter = loadcache::CompletionWaiter::new();
  cache.reload_all(vec![4], Some(waiter.clone()));
  assert!(waiter.await_completion().is_err());
  assert!(cache.get(&4).is_err(), "the error replaced the value");
}

#[test]
fn panicking_loader_is_caught_and_rethrown_as_an_error() {
  let cache = CacheBuilder::<i32, i32>::new()
    .exception_expiry_duration(Duration::from_secs(60))
    .loader(|_key: &i32| panic!("loader blew up"))
    .build()
    .unwrap();

  // The panic surfaces like any loader failure, on the calling thread.
  let error = cache.get(&1).unwrap_err();
  assert_eq!(error.key(), "1");
  assert_eq!(cache.statistics().load_exceptions, 1);

  // And it is cached like one.
  assert!(cache.get(&1).is_err());
  assert_eq!(cache.statistics().load_exceptions, 1);
}

#[test]
fn pool_worker_survives_a_panicking_load() {
  let cache = Arc::new(
    CacheBuilder::<i32, i32>::new()
      .exception_expiry_duration(Duration::from_secs(60))
      .loader_thread_count(1)
      .fallible_loader(|key: &i32| -> Result<i32, LoadError> {
        if *key == 1 {
          panic!("bad row");
        }
        Ok(key * 2)
      })
      .build()
      .unwrap(),
  );

  // The batch still settles: the panic arrives through the listener.
  let waiter = loadcache::CompletionWaiter::new();
  cache.load_all(vec![1], Some(waiter.clone()));
  let error = waiter.await_completion().unwrap_err();
  assert_eq!(error.key(), "1");

  // The single worker is alive and takes the next batch.
  let waiter = loadcache::CompletionWaiter::new();
  cache.load_all(vec![2], Some(waiter.clone()));
  waiter.await_completion().unwrap();
  assert_eq!(cache.get(&2).unwrap(), Some(4.into()));

  let stats = cache.statistics();
  assert_eq!(stats.async_loads_started, 2, "both batches were pool-run");
  assert_eq!(stats.caller_runs, 0);
  assert_eq!(stats.load_exceptions, 1);
}

struct RecordingLoader {
  saw_previous: Arc<AtomicBool>,
  calls: AtomicUsize,
}

impl AdvancedLoader<i32, i32> for RecordingLoader {
  fn load(
    &self,
    key: &i32,
    _load_time: Instant,
    previous: Option<&PreviousEntry<i32>>,
  ) -> Result<i32, LoadError> {
    let calls = self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(previous) = previous {
      self.saw_previous.store(true, Ordering::SeqCst);
      assert_eq!(previous.value().map(|v| **v), Some(100));
    } else {
      assert_eq!(calls, 0, "only the first load lacks a previous entry");
    }
    Ok(key + 100)
  }
}

#[test]
fn advanced_loader_sees_the_previous_entry_on_reload() {
  let saw_previous = Arc::new(AtomicBool::new(false));
  let loader = RecordingLoader {
    saw_previous: saw_previous.clone(),
    calls: AtomicUsize::new(0),
  };
  let cache = CacheBuilder::<i32, i32>::new()
    .advanced_loader(loader)
    .build()
    .unwrap();

  assert_eq!(cache.get(&0).unwrap(), Some(100.into()));
  assert!(!saw_previous.load(Ordering::SeqCst));

  let waiter = loadcache::CompletionWaiter::new();
  cache.reload_all(vec![0], Some(waiter.clone()));
  waiter.await_completion().unwrap();
  assert!(saw_previous.load(Ordering::SeqCst));

  let stats = cache.statistics();
  assert_eq!(stats.loads, 1);
  assert_eq!(stats.reloads, 1);
}
