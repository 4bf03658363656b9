//! Hashed timer wheel and the expiry driver thread feeding on it.
//!
//! Timers deliver sharp expiry and refresh-ahead. A timer carries the entry
//! generation it was armed for; events whose generation no longer matches
//! are discarded instead of cancelled, so the wheel never needs a cancel
//! scan.

use crate::shared::CacheShared;

use std::collections::LinkedList;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// A node in the timer wheel's linked list.
struct Timer<K> {
  laps: usize,
  key: K,
  generation: u64,
}

pub(crate) struct TimerWheel<K> {
  wheel: Vec<parking_lot::Mutex<LinkedList<Timer<K>>>>,
  current_tick: AtomicUsize,
  tick_duration: Duration,
}

impl<K> TimerWheel<K> {
  pub(crate) fn new(wheel_size: usize, tick_duration: Duration) -> Self {
    let mut wheel = Vec::with_capacity(wheel_size);
    for _ in 0..wheel_size {
      wheel.push(parking_lot::Mutex::new(LinkedList::new()));
    }
    Self {
      wheel,
      current_tick: AtomicUsize::new(0),
      tick_duration,
    }
  }

  pub(crate) fn tick_duration(&self) -> Duration {
    self.tick_duration
  }

  /// Arms a timer for `key` after roughly `delay`. Events never fire early
  /// relative to the tick grid; they may fire up to one tick late.
  pub(crate) fn schedule(&self, key: K, generation: u64, delay: Duration) {
    let ticks = (delay.as_secs_f64() / self.tick_duration.as_secs_f64()).ceil() as usize;
    let ticks = ticks.max(1);
    let current_tick = self.current_tick.load(Ordering::Relaxed);
    let laps = ticks / self.wheel.len();
    let slot = (current_tick + ticks) % self.wheel.len();

    let timer = Timer {
      laps,
      key,
      generation,
    };
    self.wheel[slot].lock().push_back(timer);
  }

  /// Moves the wheel one tick forward and returns the due timers.
  pub(crate) fn advance(&self) -> Vec<(K, u64)> {
    let tick_to_process = self.current_tick.fetch_add(1, Ordering::Relaxed);
    let slot = tick_to_process % self.wheel.len();
    let mut bucket = self.wheel[slot].lock();

    let mut due = Vec::new();
    let mut still_running = LinkedList::new();
    while let Some(mut timer) = bucket.pop_front() {
      if timer.laps > 0 {
        timer.laps -= 1;
        still_running.push_back(timer);
      } else {
        due.push((timer.key, timer.generation));
      }
    }
    *bucket = still_running;
    due
  }
}

impl<K> fmt::Debug for TimerWheel<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerWheel")
      .field("slots", &self.wheel.len())
      .field("tick_duration", &self.tick_duration)
      .finish()
  }
}

/// The background thread advancing the timer wheel. Holds the engine core
/// weakly so a dropped cache can tear down even with the driver running.
pub(crate) struct ExpiryDriver {
  stop_flag: Arc<AtomicBool>,
  _handle: JoinHandle<()>,
}

impl ExpiryDriver {
  pub(crate) fn spawn<K, V, H>(shared: Weak<CacheShared<K, V, H>>, tick: Duration) -> Self
  where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
  {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();

    let handle = thread::Builder::new()
      .name("loadcache-expiry".into())
      .spawn(move || {
        while !stop_clone.load(Ordering::Relaxed) {
          let tick_start = std::time::Instant::now();

          let Some(shared) = shared.upgrade() else {
            break;
          };
          let due = match shared.timer_wheel() {
            Some(wheel) => wheel.advance(),
            None => Vec::new(),
          };
          for (key, generation) in due {
            shared.handle_timer_event(&key, generation);
          }
          drop(shared);

          // Sleep for the remaining duration of the tick interval.
          if let Some(remaining) = tick.checked_sub(tick_start.elapsed()) {
            thread::sleep(remaining);
          }
        }
      })
      .expect("failed to spawn expiry driver");

    Self {
      stop_flag,
      _handle: handle,
    }
  }

  /// Signals the driver thread to stop.
  pub(crate) fn stop(self) {
    self.stop_flag.store(true, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timer_fires_after_enough_ticks() {
    let wheel = TimerWheel::new(4, Duration::from_millis(10));
    // Two ticks out: lands in slot 2, processed by the third advance.
    wheel.schedule(1, 7, Duration::from_millis(20));

    assert!(wheel.advance().is_empty());
    assert!(wheel.advance().is_empty());
    assert_eq!(wheel.advance(), vec![(1, 7)]);
  }

  #[test]
  fn delays_beyond_the_wheel_take_laps() {
    let wheel = TimerWheel::new(2, Duration::from_millis(10));
    // Five ticks on a two-slot wheel: two full laps before delivery.
    wheel.schedule(9, 1, Duration::from_millis(50));

    let mut fired_at = None;
    for tick in 1..=8 {
      if !wheel.advance().is_empty() {
        fired_at = Some(tick);
        break;
      }
    }
    assert_eq!(fired_at, Some(6));
  }

  #[test]
  fn zero_delay_fires_within_one_full_tick() {
    let wheel = TimerWheel::new(4, Duration::from_millis(10));
    // Rounded up to one tick ahead, never the slot currently processed.
    wheel.schedule(3, 0, Duration::ZERO);
    assert!(wheel.advance().is_empty());
    assert_eq!(wheel.advance(), vec![(3, 0)]);
  }
}
