//! Pluggable eviction strategies.

pub mod clock;

pub use clock::ClockPolicy;

/// Tracks key recency/ordering and nominates eviction victims. The engine
/// owns entry lifecycle; a policy only sees keys.
///
/// `choose_victim` removes the returned key from the policy's tracking. A
/// candidate the engine cannot evict (it is pinned by an operation in
/// flight) is handed back via `on_insert`.
pub trait EvictionPolicy<K>: Send + Sync {
  /// A new entry was added to the store.
  fn on_insert(&self, key: &K);

  /// An entry was read.
  fn on_access(&self, key: &K);

  /// An entry left the store for any reason other than `choose_victim`.
  fn on_remove(&self, key: &K);

  /// Nominates and untracks the next victim. `None` when nothing is
  /// tracked.
  fn choose_victim(&self) -> Option<K>;

  /// Drops all tracking state.
  fn clear(&self);
}
