//! Bounded LRU (Least Recently Used) ordering

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded LRU index using lazy cleanup.
///
/// Only tracks keys and their recency; values live with the owner.
/// [`LruIndex::insert`] reports the key it pushed out when full.
pub struct LruIndex<K: Clone + Eq + Hash> {
    /// Order of access with generation (front = oldest)
    order: VecDeque<(K, u64)>,
    /// key -> current generation
    positions: HashMap<K, u64>,
    /// Generation counter for tracking freshness
    generation: u64,
    /// Maximum number of live keys
    capacity: usize,
}

impl<K: Clone + Eq + Hash> LruIndex<K> {
    /// Create an index holding at most `capacity` keys (minimum 1)
    pub fn new(capacity: usize) -> Self {
        LruIndex {
            order: VecDeque::new(),
            positions: HashMap::new(),
            generation: 0,
            capacity: capacity.max(1),
        }
    }

    /// Insert or refresh `key` as most recently used.
    ///
    /// Returns the evicted key if a new key pushed the index over capacity.
    pub fn insert(&mut self, key: K) -> Option<K> {
        let is_new = !self.positions.contains_key(&key);
        let evicted = if is_new && self.positions.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        self.generation += 1;
        self.positions.insert(key.clone(), self.generation);
        self.order.push_back((key, self.generation));

        if self.order.len() > self.capacity * 4 {
            self.compact();
        }
        evicted
    }

    /// Mark an existing key as recently used
    pub fn touch(&mut self, key: &K) {
        if self.positions.contains_key(key) {
            self.generation += 1;
            self.positions.insert(key.clone(), self.generation);
            self.order.push_back((key.clone(), self.generation));
            if self.order.len() > self.capacity * 4 {
                self.compact();
            }
        }
    }

    /// Forget a key
    pub fn remove(&mut self, key: &K) {
        // Stale order entries are skipped when popping
        self.positions.remove(key);
    }

    /// Pop the least recently used key
    pub fn pop_oldest(&mut self) -> Option<K> {
        while let Some((key, entry_gen)) = self.order.pop_front() {
            if self.positions.get(&key) == Some(&entry_gen) {
                self.positions.remove(&key);
                return Some(key);
            }
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Drop stale entries from the access order
    fn compact(&mut self) {
        let mut items: Vec<_> = self.positions.iter().map(|(k, &g)| (k.clone(), g)).collect();
        items.sort_by_key(|(_, g)| *g);
        self.order = items.into_iter().collect();
    }
}
