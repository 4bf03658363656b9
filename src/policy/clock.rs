use super::EvictionPolicy;

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// An eviction policy based on the Clock (or Second-Chance) algorithm.
/// It provides an efficient approximation of LRU and is the default.
#[derive(Debug)]
pub struct ClockPolicy<K> {
  // The referenced bit of each tracked key.
  items: Mutex<HashMap<K, bool>>,
  // A vector of keys representing the circular "clock face".
  order: Mutex<Vec<K>>,
  // The "hand" of the clock, pointing to the next victim candidate.
  hand: Mutex<usize>,
}

impl<K> ClockPolicy<K> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(HashMap::new()),
      order: Mutex::new(Vec::new()),
      hand: Mutex::new(0),
    }
  }
}

impl<K> Default for ClockPolicy<K> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K> EvictionPolicy<K> for ClockPolicy<K>
where
  K: Eq + Hash + Clone + Send + Sync,
{
  fn on_insert(&self, key: &K) {
    let mut order = self.order.lock();
    let mut items = self.items.lock();
    if !items.contains_key(key) {
      items.insert(key.clone(), false);
      order.push(key.clone());
    }
  }

  /// On access, set the "referenced" bit.
  fn on_access(&self, key: &K) {
    let mut items = self.items.lock();
    if let Some(referenced) = items.get_mut(key) {
      *referenced = true;
    }
  }

  fn on_remove(&self, key: &K) {
    let mut order = self.order.lock();
    let mut items = self.items.lock();
    let mut hand = self.hand.lock();
    if items.remove(key).is_some() {
      if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
        // If the removed item was before or at the hand, adjust the hand.
        if pos <= *hand && *hand > 0 {
          *hand -= 1;
        }
      }
    }
  }

  /// Sweeps the hand: referenced items get their bit cleared and a second
  /// chance, the first unreferenced item becomes the victim.
  fn choose_victim(&self) -> Option<K> {
    let mut order = self.order.lock();
    let mut items = self.items.lock();
    let mut hand = self.hand.lock();

    if order.is_empty() {
      return None;
    }

    let mut swept = 0;
    let limit = order.len() * 2;
    while swept <= limit {
      if *hand >= order.len() {
        *hand = 0;
      }
      let key = &order[*hand];
      match items.get_mut(key) {
        Some(referenced) if *referenced => {
          *referenced = false;
          *hand += 1;
        }
        _ => {
          let victim = order.remove(*hand);
          items.remove(&victim);
          return Some(victim);
        }
      }
      swept += 1;
    }
    None
  }

  fn clear(&self) {
    self.items.lock().clear();
    self.order.lock().clear();
    *self.hand.lock() = 0;
  }
}
