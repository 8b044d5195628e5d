//! Bounded caches with pluggable eviction scoring.
//!
//! [`GenericCache`] keeps its entries in a binary min-heap ordered by a
//! score computed by a [`CachePolicy`], plus a key to heap-index map. The
//! entry with the lowest score is evicted first. Pinned entries sort after
//! every unpinned entry and are never evicted.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::ConjectureError;

/// Computes the eviction score of cache entries.
pub trait CachePolicy<K, V> {
    type Score: Ord + Clone;

    /// Score of a freshly inserted entry
    fn new_entry(&mut self, key: &K, value: &V) -> Self::Score;

    /// New score of an entry that was read or overwritten
    fn on_access(&mut self, _key: &K, _value: &V, score: &Self::Score) -> Self::Score {
        score.clone()
    }

    /// Called once for every entry removed to make room
    fn on_evict(&mut self, _key: &K, _value: &V, _score: &Self::Score) {}
}

/// Least recently used eviction
#[derive(Debug, Default, Clone)]
pub struct Lru {
    tick: u64,
}

impl<K, V> CachePolicy<K, V> for Lru {
    type Score = u64;

    fn new_entry(&mut self, _key: &K, _value: &V) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn on_access(&mut self, _key: &K, _value: &V, _score: &u64) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Least frequently used eviction
#[derive(Debug, Default, Clone, Copy)]
pub struct Lfu;

impl<K, V> CachePolicy<K, V> for Lfu {
    type Score = u64;

    fn new_entry(&mut self, _key: &K, _value: &V) -> u64 {
        1
    }

    fn on_access(&mut self, _key: &K, _value: &V, score: &u64) -> u64 {
        score + 1
    }
}

/// LRU with two generations: entries touched again after insertion
/// outlive entries that were only ever written once.
#[derive(Debug, Default, Clone)]
pub struct LruReused {
    tick: u64,
}

impl<K, V> CachePolicy<K, V> for LruReused {
    type Score = (u8, u64);

    fn new_entry(&mut self, _key: &K, _value: &V) -> (u8, u64) {
        self.tick += 1;
        (1, self.tick)
    }

    fn on_access(&mut self, _key: &K, _value: &V, _score: &(u8, u64)) -> (u8, u64) {
        self.tick += 1;
        (2, self.tick)
    }
}

/// Scores an entry by its value, so the smallest value is evicted first
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueScored;

impl<K, V: Ord + Clone> CachePolicy<K, V> for ValueScored {
    type Score = V;

    fn new_entry(&mut self, _key: &K, value: &V) -> V {
        value.clone()
    }
}

#[derive(Debug, Clone)]
struct Entry<K, V, S> {
    key: K,
    value: V,
    score: S,
    pins: usize,
}

impl<K, V, S: Ord> Entry<K, V, S> {
    fn sort_key(&self) -> (bool, &S) {
        (self.pins > 0, &self.score)
    }
}

/// Fixed-capacity map that evicts its lowest-scoring entry when full.
pub struct GenericCache<K, V, P: CachePolicy<K, V>> {
    max_size: usize,
    data: Vec<Entry<K, V, P::Score>>,
    keys_to_indices: HashMap<K, usize>,
    policy: P,
}

impl<K, V, P> fmt::Debug for GenericCache<K, V, P>
where
    K: fmt::Debug,
    V: fmt::Debug,
    P: CachePolicy<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.data.iter().map(|e| (&e.key, &e.value)))
            .finish()
    }
}

impl<K, V, P> GenericCache<K, V, P>
where
    K: Hash + Eq + Clone,
    P: CachePolicy<K, V>,
{
    /// Create a cache holding at most `max_size` entries
    pub fn new(max_size: usize, policy: P) -> Result<Self, ConjectureError> {
        if max_size == 0 {
            return Err(ConjectureError::invalid_argument(
                "cache max_size must be positive",
            ));
        }
        Ok(Self {
            max_size,
            data: Vec::new(),
            keys_to_indices: HashMap::new(),
            policy,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.data.len(), self.keys_to_indices.len());
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.keys_to_indices.contains_key(key)
    }

    /// Keys currently resident, in heap order
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.iter().map(|e| &e.key)
    }

    /// Read without counting as an access
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.keys_to_indices.get(key).map(|&i| &self.data[i].value)
    }

    /// Read `key`, counting as an access for scoring
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let i = *self.keys_to_indices.get(key)?;
        let entry = &self.data[i];
        let score = self.policy.on_access(&entry.key, &entry.value, &entry.score);
        self.data[i].score = score;
        let i = self.balance(i);
        Some(&self.data[i].value)
    }

    /// Insert or overwrite `key`. Returns the evicted entry, if any.
    ///
    /// Fails without modifying the cache if room is needed but every
    /// resident entry is pinned.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<(K, V)>, ConjectureError> {
        if let Some(&i) = self.keys_to_indices.get(&key) {
            let entry = &mut self.data[i];
            entry.value = value;
            let score = self
                .policy
                .on_access(&entry.key, &entry.value, &entry.score);
            self.data[i].score = score;
            self.balance(i);
            return Ok(None);
        }

        if self.data.len() >= self.max_size && self.data[0].pins > 0 {
            return Err(ConjectureError::invalid_argument(
                "cannot insert into a cache whose entries are all pinned",
            ));
        }
        let score = self.policy.new_entry(&key, &value);
        let entry = Entry {
            key: key.clone(),
            value,
            score,
            pins: 0,
        };

        let (i, evicted) = if self.data.len() >= self.max_size {
            let evicted = std::mem::replace(&mut self.data[0], entry);
            self.keys_to_indices.remove(&evicted.key);
            (0, Some(evicted))
        } else {
            self.data.push(entry);
            (self.data.len() - 1, None)
        };
        self.keys_to_indices.insert(key, i);
        self.balance(i);

        Ok(evicted.map(|evicted| {
            self.policy
                .on_evict(&evicted.key, &evicted.value, &evicted.score);
            (evicted.key, evicted.value)
        }))
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.keys_to_indices.remove(key)?;
        let removed = self.data.swap_remove(i);
        if i < self.data.len() {
            self.keys_to_indices.insert(self.data[i].key.clone(), i);
            self.balance(i);
        }
        Some(removed.value)
    }

    /// Insert `key` and protect it from eviction until a matching `unpin`.
    ///
    /// Pins are counted: pinning twice needs two unpins.
    pub fn pin(&mut self, key: K, value: V) -> Result<(), ConjectureError> {
        self.insert(key.clone(), value)?;
        if let Some(&i) = self.keys_to_indices.get(&key) {
            self.data[i].pins += 1;
            self.balance(i);
        }
        Ok(())
    }

    /// Release one pin on `key`
    pub fn unpin(&mut self, key: &K) -> Result<(), ConjectureError> {
        let i = match self.keys_to_indices.get(key) {
            Some(&i) if self.data[i].pins > 0 => i,
            _ => {
                return Err(ConjectureError::invalid_argument(
                    "unpin called for a key that is not pinned",
                ));
            }
        };
        self.data[i].pins -= 1;
        self.balance(i);
        Ok(())
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.keys_to_indices
            .get(key)
            .is_some_and(|&i| self.data[i].pins > 0)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.keys_to_indices.clear();
    }

    /// Verify the heap order and the key/index bijection. O(n).
    ///
    /// # Panics
    ///
    /// Panics if either invariant is broken.
    pub fn check_valid(&self) {
        assert_eq!(self.data.len(), self.keys_to_indices.len());
        assert!(self.data.len() <= self.max_size);
        for (i, entry) in self.data.iter().enumerate() {
            assert_eq!(self.keys_to_indices.get(&entry.key), Some(&i));
            for j in [2 * i + 1, 2 * i + 2] {
                if let Some(child) = self.data.get(j) {
                    assert!(
                        entry.sort_key() <= child.sort_key(),
                        "heap order broken between {} and {}",
                        i,
                        j
                    );
                }
            }
        }
    }

    fn out_of_order(&self, parent: usize, child: usize) -> bool {
        self.data[child].sort_key() < self.data[parent].sort_key()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.data.swap(i, j);
        self.keys_to_indices.insert(self.data[i].key.clone(), i);
        self.keys_to_indices.insert(self.data[j].key.clone(), j);
    }

    /// Restore heap order around `i`, returning the entry's final index
    fn balance(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.out_of_order(parent, i) {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < self.data.len() && self.out_of_order(smallest, left) {
                smallest = left;
            }
            if right < self.data.len()
                && self.data[right].sort_key() < self.data[smallest].sort_key()
            {
                smallest = right;
            }
            if smallest == i {
                return i;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}
