use std::sync::atomic::{AtomicUsize, Ordering};

/// An ordered set of endpoints with a round-robin cursor.
///
/// Selection is O(1) and lock-free. There is no health tracking; a bad
/// endpoint keeps its turn in the rotation.
pub struct ListSelector<T> {
    items: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> ListSelector<T> {
    /// Returns `None` for an empty list; a selector always has something to
    /// select.
    pub fn new(items: Vec<T>) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        Some(ListSelector { items, cursor: AtomicUsize::new(0) })
    }

    pub fn select(&self) -> &T {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.items[i % self.items.len()]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}
