use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry<T> {
    /// `None` once the cell has been released (tombstone).
    value: Option<T>,
}

impl<T> Entry<T> {
    /// Create a new occupied cell with the given value.
    pub fn new(value: T) -> Self {
        Self { value: Some(value) }
    }

    /// Check if the cell is occupied.
    pub fn occupied(&self) -> bool {
        self.value.is_some()
    }
}

/// Arena of values addressed by `usize` indices.
///
/// Released cells are kept as tombstones and their indices are never handed
/// out again, so a stale index is always detected instead of silently aliasing
/// a newer value. Index `0` is a permanently occupied sentinel.
#[derive(Debug, Clone)]
pub struct Table<T> {
    data: Vec<Entry<T>>,

    /// Hard ceiling on the number of cells (sentinel included).
    capacity: usize,
    /// Number of occupied cells.
    real_size: usize,
}

impl<T> Table<T> {
    /// Create a new table holding at most `capacity` cells.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "Table capacity should be at least 1");

        Self {
            data: Vec::new(),
            capacity,
            real_size: 0,
        }
    }

    /// Get the capacity of the table.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// Get the index one past the last ever allocated cell.
    pub fn size(&self) -> usize {
        self.data.len() + 1
    }
    /// Get the number of occupied cells.
    pub fn real_size(&self) -> usize {
        self.real_size
    }

    /// Check whether the index was ever handed out by [`Table::add`].
    pub fn is_allocated(&self, index: usize) -> bool {
        index != 0 && index < self.size()
    }

    /// Check if the cell at the given index is occupied.
    pub fn is_occupied(&self, index: usize) -> bool {
        self.is_allocated(index) && self.data[index - 1].occupied()
    }

    /// Get the reference to the value at the given index, if occupied.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index == 0 {
            return None;
        }
        self.data.get(index - 1).and_then(|e| e.value.as_ref())
    }
    /// Get the mutable reference to the value at the given index, if occupied.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index == 0 {
            return None;
        }
        self.data.get_mut(index - 1).and_then(|e| e.value.as_mut())
    }

    /// Add a new value to the table and return its index.
    ///
    /// Returns `None` when the capacity ceiling is reached.
    pub fn add(&mut self, value: T) -> Option<usize> {
        if self.size() >= self.capacity {
            return None;
        }

        self.data.push(Entry::new(value));
        self.real_size += 1;

        Some(self.data.len())
    }

    /// Release the value at the given index, leaving a tombstone.
    pub fn drop(&mut self, index: usize) -> Option<T> {
        assert_ne!(index, 0, "Index is 0");

        let value = self.data.get_mut(index - 1)?.value.take()?;
        self.real_size -= 1;
        Some(value)
    }

    /// Iterate over the occupied cells in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.value.as_ref().map(|v| (i + 1, v)))
    }

    /// Iterate mutably over the occupied cells in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.data
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.value.as_mut().map(|v| (i + 1, v)))
    }
}

impl<T> Index<usize> for Table<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        match self.get(index) {
            Some(value) => value,
            None => panic!("Index {} is not occupied", index),
        }
    }
}

impl<T> IndexMut<usize> for Table<T> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("Index {} is not occupied", index),
        }
    }
}
