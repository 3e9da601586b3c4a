//! Fixed-capacity, insertion-ordered sample history.

use std::collections::VecDeque;
use std::sync::RwLock;

/// Thread-safe ring buffer. Writers take the exclusive lock, readers the shared one.
#[derive(Debug)]
pub struct BoundedHistory<T> {
    capacity: usize,
    items: RwLock<VecDeque<T>>,
}

impl<T: Clone> BoundedHistory<T> {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an item, evicting the oldest one once full.
    pub fn push(&self, item: T) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Every retained item, oldest first.
    pub fn get_all(&self) -> Vec<T> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items.iter().cloned().collect()
    }

    /// The last `min(n, len)` items, oldest first.
    pub fn get_recent(&self, n: usize) -> Vec<T> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        let skip = items.len().saturating_sub(n);
        items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
