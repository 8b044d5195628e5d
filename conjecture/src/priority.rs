//! Keyed min-priority queue with in-place priority updates.

use std::collections::HashMap;
use std::hash::Hash;

/// A binary min-heap of `(key, priority)` pairs plus a key to index map,
/// so a key's priority can be changed or removed in O(log n).
#[derive(Debug, Clone)]
pub struct PriorityMap<K, P> {
    heap: Vec<(K, P)>,
    indices: HashMap<K, usize>,
}

impl<K: Hash + Eq + Clone, P: Ord> Default for PriorityMap<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, P: Ord> PriorityMap<K, P> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            indices: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.indices.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&P> {
        self.indices.get(key).map(|&i| &self.heap[i].1)
    }

    /// Insert `key`, or move it to `priority` if already present
    pub fn insert(&mut self, key: K, priority: P) {
        match self.indices.get(&key) {
            Some(&i) => {
                self.heap[i].1 = priority;
                self.balance(i);
            }
            None => {
                self.heap.push((key.clone(), priority));
                let i = self.heap.len() - 1;
                self.indices.insert(key, i);
                self.balance(i);
            }
        }
    }

    /// The entry with the lowest priority
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.heap.first().map(|(k, p)| (k, p))
    }

    /// Remove and return the entry with the lowest priority
    pub fn pop(&mut self) -> Option<(K, P)> {
        let key = self.heap.first()?.0.clone();
        self.remove(&key).map(|priority| (key, priority))
    }

    /// Remove `key`, returning its priority
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let i = self.indices.remove(key)?;
        let (_, priority) = self.heap.swap_remove(i);
        if i < self.heap.len() {
            self.indices.insert(self.heap[i].0.clone(), i);
            self.balance(i);
        }
        Some(priority)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.indices.clear();
    }

    /// Verify heap order and the key/index bijection.
    ///
    /// # Panics
    ///
    /// Panics if either invariant is broken.
    pub fn check_valid(&self) {
        assert_eq!(self.heap.len(), self.indices.len());
        for (i, (key, priority)) in self.heap.iter().enumerate() {
            assert_eq!(self.indices.get(key), Some(&i));
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].1 <= *priority);
            }
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.indices.insert(self.heap[i].0.clone(), i);
        self.indices.insert(self.heap[j].0.clone(), j);
    }

    fn balance(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].1 >= self.heap[parent].1 {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len() && self.heap[child].1 < self.heap[smallest].1 {
                    smallest = child;
                }
            }
            if smallest == i {
                return;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}
