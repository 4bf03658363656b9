use crate::error::{CacheError, LoadError};
use crate::time;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// What the cache held for a key before a reload or refresh, offered to the
/// loader so it can issue conditional fetches.
pub struct PreviousEntry<V> {
  pub(crate) value: Option<Arc<V>>,
  pub(crate) exception: Option<CacheError>,
  pub(crate) last_modification: u64,
}

impl<V> PreviousEntry<V> {
  /// The previously cached value, if the entry held one.
  pub fn value(&self) -> Option<&Arc<V>> {
    self.value.as_ref()
  }

  /// The previously cached loader error, if the entry held one.
  pub fn exception(&self) -> Option<&CacheError> {
    self.exception.as_ref()
  }

  /// When the previous data was installed.
  pub fn last_modification(&self) -> Instant {
    time::nanos_to_instant(self.last_modification)
  }
}

/// The full loader contract: receives the load time and, on reload or
/// refresh, a view of the previous entry. Plain closures registered through
/// the builder are adapted onto this shape.
pub trait AdvancedLoader<K, V>: Send + Sync {
  fn load(
    &self,
    key: &K,
    load_time: Instant,
    previous: Option<&PreviousEntry<V>>,
  ) -> Result<V, LoadError>;
}

/// Internal loader representation. Cheap to clone so in-flight loads can
/// outlive the handle that submitted them.
pub(crate) enum Loader<K, V> {
  Simple(Arc<dyn Fn(&K) -> V + Send + Sync>),
  Fallible(Arc<dyn Fn(&K) -> Result<V, LoadError> + Send + Sync>),
  Advanced(Arc<dyn AdvancedLoader<K, V>>),
}

impl<K, V> Clone for Loader<K, V> {
  fn clone(&self) -> Self {
    match self {
      Loader::Simple(f) => Loader::Simple(f.clone()),
      Loader::Fallible(f) => Loader::Fallible(f.clone()),
      Loader::Advanced(l) => Loader::Advanced(l.clone()),
    }
  }
}

impl<K, V> Loader<K, V> {
  /// Invokes the loader. A panic in user loader code is caught here and
  /// surfaces as an ordinary loader error; it never unwinds into the engine
  /// or a pool worker.
  pub(crate) fn load(
    &self,
    key: &K,
    load_time: u64,
    previous: Option<&PreviousEntry<V>>,
  ) -> Result<V, LoadError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match self {
      Loader::Simple(f) => Ok(f(key)),
      Loader::Fallible(f) => f(key),
      Loader::Advanced(l) => l.load(key, time::nanos_to_instant(load_time), previous),
    }));
    outcome.unwrap_or_else(|payload| Err(panic_to_error(payload)))
  }
}

fn panic_to_error(payload: Box<dyn Any + Send>) -> LoadError {
  let message = if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  };
  format!("loader panicked: {message}").into()
}
