//! Completion signalling for the asynchronous bulk operations.

use crate::error::CacheError;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Receives the outcome of a `load_all`, `reload_all` or `prefetch_all`
/// batch. Exactly one of the two methods is called, once, after every key
/// in the batch has settled.
pub trait CompletionListener: Send + Sync {
  fn on_completed(&self);
  /// Called with the first error the batch produced.
  fn on_exception(&self, error: CacheError);
}

struct WaiterState {
  done: bool,
  error: Option<CacheError>,
}

/// A one-shot latch implementing [`CompletionListener`], for callers that
/// want to block until a batch finishes.
pub struct CompletionWaiter {
  state: Mutex<WaiterState>,
  settled: Condvar,
}

impl CompletionWaiter {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(WaiterState {
        done: false,
        error: None,
      }),
      settled: Condvar::new(),
    })
  }

  /// Blocks until the batch completes; rethrows its first error.
  pub fn await_completion(&self) -> Result<(), CacheError> {
    let mut state = self.state.lock();
    while !state.done {
      self.settled.wait(&mut state);
    }
    match &state.error {
      Some(error) => Err(error.clone()),
      None => Ok(()),
    }
  }

  /// Non-blocking view of the batch error, if it already finished with one.
  pub fn exception(&self) -> Option<CacheError> {
    self.state.lock().error.clone()
  }
}

impl CompletionListener for CompletionWaiter {
  fn on_completed(&self) {
    let mut state = self.state.lock();
    state.done = true;
    self.settled.notify_all();
  }

  fn on_exception(&self, error: CacheError) {
    let mut state = self.state.lock();
    state.error = Some(error);
    state.done = true;
    self.settled.notify_all();
  }
}

/// Tracks one in-flight batch. Every key settles exactly once; when the
/// remaining count reaches zero the listener fires with the first captured
/// error, or completion when there was none.
pub(crate) struct BatchContext {
  remaining: AtomicUsize,
  listener: Option<Arc<dyn CompletionListener>>,
  first_error: Mutex<Option<CacheError>>,
}

impl BatchContext {
  pub(crate) fn new(
    remaining: usize,
    listener: Option<Arc<dyn CompletionListener>>,
  ) -> Arc<Self> {
    Arc::new(Self {
      remaining: AtomicUsize::new(remaining),
      listener,
      first_error: Mutex::new(None),
    })
  }

  pub(crate) fn settle_ok(&self) {
    self.finish_one();
  }

  pub(crate) fn settle_err(&self, error: CacheError) {
    self.first_error.lock().get_or_insert(error);
    self.finish_one();
  }

  /// Fires the listener directly; only valid for an empty batch.
  pub(crate) fn fire_empty(&self) {
    self.fire();
  }

  fn finish_one(&self) {
    if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.fire();
    }
  }

  fn fire(&self) {
    if let Some(listener) = &self.listener {
      match self.first_error.lock().take() {
        Some(error) => listener.on_exception(error),
        None => listener.on_completed(),
      }
    }
  }
}
