//! Bounded set of recently seen keys, shared by the spark and context
//! dedupe windows.

use std::hash::Hash;

use indexmap::IndexSet;

/// Bounded set of recently seen keys. Once full, the oldest key is evicted
/// to make room.
#[derive(Debug, Clone)]
pub struct RecentSet<K: Hash + Eq> {
    capacity: usize,
    keys: IndexSet<K>,
}

impl<K: Hash + Eq> RecentSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: IndexSet::new(),
        }
    }

    /// Returns `true` when `key` was not already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() >= self.capacity {
            self.keys.shift_remove_index(0);
        }
        self.keys.insert(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut seen = RecentSet::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(!seen.contains(&"a"));
        assert!(seen.contains(&"b"));
        assert_eq!(seen.len(), 2);
    }
}
