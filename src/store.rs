use crate::entry::CacheEntry;

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// Computes the hash of a key using the store's hasher.
#[inline]
pub(crate) fn hash_key<K: Hash + ?Sized, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

/// Outcome of detaching an entry from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
  Removed,
  /// Another operation already detached or replaced this entry.
  AlreadyGone,
  /// The key's hash no longer matches the hash captured at insertion. The
  /// mapping cannot be located reliably; counted, not corrected.
  HashMutated,
}

/// Sharded entry table. Each shard is an independently locked hash map,
/// padded to avoid false sharing between shard locks.
pub(crate) struct EntryStore<K, V, H> {
  shards: Box<[CachePadded<RwLock<HashMap<K, Arc<CacheEntry<K, V>>, H>>>]>,
  hasher: H,
  entry_count: AtomicU64,
}

impl<K, V, H> EntryStore<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  /// `num_shards` must be a power of two.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    debug_assert!(num_shards.is_power_of_two());
    let shards = (0..num_shards)
      .map(|_| CachePadded::new(RwLock::new(HashMap::with_hasher(hasher.clone()))))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self {
      shards,
      hasher,
      entry_count: AtomicU64::new(0),
    }
  }

  #[inline]
  fn shard_index(&self, hash: u64) -> usize {
    hash as usize & (self.shards.len() - 1)
  }

  pub(crate) fn lookup(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
    let hash = hash_key(&self.hasher, key);
    let shard = &self.shards[self.shard_index(hash)];
    shard.read().get(key).cloned()
  }

  /// Returns the entry for `key`, creating a pinned `Empty` one when absent.
  /// The boolean reports whether this call created it.
  pub(crate) fn lookup_or_create(&self, key: &K) -> (Arc<CacheEntry<K, V>>, bool) {
    let hash = hash_key(&self.hasher, key);
    let shard = &self.shards[self.shard_index(hash)];
    {
      let guard = shard.read();
      if let Some(entry) = guard.get(key) {
        return (entry.clone(), false);
      }
    }
    let mut guard = shard.write();
    if let Some(entry) = guard.get(key) {
      return (entry.clone(), false);
    }
    let entry = Arc::new(CacheEntry::new_pinned(key.clone(), hash));
    guard.insert(key.clone(), entry.clone());
    self.entry_count.fetch_add(1, Ordering::Relaxed);
    (entry, true)
  }

  /// Detaches this exact entry. A mapping that now points at a different
  /// `Arc` for the same key is left untouched.
  pub(crate) fn remove_entry(&self, entry: &Arc<CacheEntry<K, V>>) -> RemoveOutcome {
    let hash = hash_key(&self.hasher, &entry.key);
    if hash != entry.key_hash {
      return RemoveOutcome::HashMutated;
    }
    let shard = &self.shards[self.shard_index(hash)];
    let mut guard = shard.write();
    match guard.get(&entry.key) {
      Some(current) if Arc::ptr_eq(current, entry) => {
        guard.remove(&entry.key);
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        RemoveOutcome::Removed
      }
      _ => RemoveOutcome::AlreadyGone,
    }
  }

  /// Empties every shard and returns the detached entries so the caller can
  /// settle their state without holding shard locks.
  pub(crate) fn drain_all(&self) -> Vec<Arc<CacheEntry<K, V>>> {
    let mut entries = Vec::new();
    for shard in self.shards.iter() {
      let mut guard = shard.write();
      let drained = guard.len() as u64;
      entries.extend(guard.drain().map(|(_, entry)| entry));
      self.entry_count.fetch_sub(drained, Ordering::Relaxed);
    }
    entries
  }

  /// Snapshot of all entries. Shard locks are taken one at a time.
  pub(crate) fn collect_entries(&self) -> Vec<Arc<CacheEntry<K, V>>> {
    let mut entries = Vec::with_capacity(self.len() as usize);
    for shard in self.shards.iter() {
      entries.extend(shard.read().values().cloned());
    }
    entries
  }

  pub(crate) fn len(&self) -> u64 {
    self.entry_count.load(Ordering::Relaxed)
  }

  /// Entry count of the most populated shard.
  pub(crate) fn longest_slot(&self) -> u64 {
    self
      .shards
      .iter()
      .map(|shard| shard.read().len() as u64)
      .max()
      .unwrap_or(0)
  }

  /// Percentage of entries that share a shard with at least one other entry.
  pub(crate) fn collision_percentage(&self) -> u32 {
    let mut total = 0u64;
    let mut colliding = 0u64;
    for shard in self.shards.iter() {
      let len = shard.read().len() as u64;
      total += len;
      if len > 1 {
        colliding += len;
      }
    }
    if total == 0 {
      0
    } else {
      ((colliding * 100) / total) as u32
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entry::EntryState;

  fn store(shards: usize) -> EntryStore<i32, i32, ahash::RandomState> {
    EntryStore::new(shards, ahash::RandomState::new())
  }

  #[test]
  fn create_then_lookup() {
    let store = store(4);
    let (created, was_new) = store.lookup_or_create(&7);
    assert!(was_new);
    assert_eq!(created.inner.lock().state, EntryState::Empty);
    assert_eq!(created.inner.lock().pin_count, 1);

    let (again, was_new) = store.lookup_or_create(&7);
    assert!(!was_new);
    assert!(Arc::ptr_eq(&created, &again));
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn remove_is_identity_based() {
    let store = store(4);
    let (first, _) = store.lookup_or_create(&1);
    assert_eq!(store.remove_entry(&first), RemoveOutcome::Removed);
    assert_eq!(store.len(), 0);

    // A second removal of the same Arc must not touch a successor mapping.
    let (second, was_new) = store.lookup_or_create(&1);
    assert!(was_new);
    assert_eq!(store.remove_entry(&first), RemoveOutcome::AlreadyGone);
    assert!(store.lookup(&1).is_some());
    assert_eq!(store.remove_entry(&second), RemoveOutcome::Removed);
  }

  #[test]
  fn drain_returns_everything() {
    let store = store(2);
    for k in 0..10 {
      store.lookup_or_create(&k);
    }
    let drained = store.drain_all();
    assert_eq!(drained.len(), 10);
    assert_eq!(store.len(), 0);
    assert!(store.lookup(&3).is_none());
  }

  #[test]
  fn slot_diagnostics() {
    let store = store(1);
    assert_eq!(store.collision_percentage(), 0);
    store.lookup_or_create(&1);
    assert_eq!(store.longest_slot(), 1);
    assert_eq!(store.collision_percentage(), 0);
    store.lookup_or_create(&2);
    // A single shard makes every co-resident entry a collision.
    assert_eq!(store.longest_slot(), 2);
    assert_eq!(store.collision_percentage(), 100);
  }
}
