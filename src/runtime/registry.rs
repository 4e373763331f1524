//! Growable array used for the worker registry.
//!
//! Contiguous, insertion-ordered storage that grows by a fixed factor of
//! 1.5 when full, giving O(1) amortized append. Removal compacts the tail
//! so order is preserved.

/// Capacity used when zero is requested.
pub const DEFAULT_CAPACITY: usize = 16;

/// Contiguous array with explicit 1.5x growth.
#[derive(Debug)]
pub struct GrowableArray<T> {
    items: Vec<T>,
    cap: usize,
}

impl<T> GrowableArray<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = if cap == 0 { DEFAULT_CAPACITY } else { cap };
        Self {
            items: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Append at the end, growing by 1.5x if full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.cap {
            // round(cap * 1.5), never less than cap + 1
            let grown = (self.cap * 3 + 1) / 2;
            let new_cap = grown.max(self.cap + 1);
            self.items.reserve_exact(new_cap - self.items.len());
            self.cap = new_cap;
        }
        self.items.push(item);
    }

    /// Remove the element at `index`, shifting later elements down.
    ///
    /// Returns `None` if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Logical capacity (follows the 1.5x schedule).
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Remove every element, front to back.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }
}
