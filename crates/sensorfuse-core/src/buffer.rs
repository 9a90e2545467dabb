//! Fixed-capacity ring buffer.

use std::collections::VecDeque;

/// Fixed-capacity FIFO that evicts its oldest entries when full.
///
/// The length never exceeds the capacity. A buffer with capacity zero
/// discards everything pushed into it.
#[derive(Debug, Clone, PartialEq)]
pub struct CircularBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    /// Create an empty buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append an item, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Append many items, then evict the overflow from the front in one
    /// operation. Returns how many items were evicted.
    pub fn extend_bulk(&mut self, items: impl IntoIterator<Item = T>) -> usize {
        self.items.extend(items);
        let overflow = self.items.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.items.drain(..overflow);
        }
        overflow
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently pushed item.
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> CircularBuffer<T> {
    /// Copy the contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Copy the newest `n` items, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut buf = CircularBuffer::new(3);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), None);
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.to_vec(), vec![2, 3, 4]);
        assert_eq!(buf.latest(), Some(&4));
    }

    #[test]
    fn test_extend_bulk_drains_front() {
        let mut buf = CircularBuffer::new(4);
        buf.extend_bulk([1, 2, 3]);
        assert_eq!(buf.extend_bulk([4, 5, 6]), 2);
        assert_eq!(buf.to_vec(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buf = CircularBuffer::new(0);
        assert_eq!(buf.push("a"), Some("a"));
        assert_eq!(buf.extend_bulk(["b", "c"]), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_recent() {
        let mut buf = CircularBuffer::new(10);
        buf.extend_bulk(0..6);
        assert_eq!(buf.recent(2), vec![4, 5]);
        assert_eq!(buf.recent(100).len(), 6);
    }
}

/// Property-based tests for the ring buffer.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A buffer of capacity C holds exactly the C most recent entries, in order.
        #[test]
        fn holds_most_recent_in_order(
            capacity in 0usize..32,
            items in proptest::collection::vec(any::<u32>(), 0..100),
        ) {
            let mut buf = CircularBuffer::new(capacity);
            for item in &items {
                buf.push(*item);
                prop_assert!(buf.len() <= capacity);
            }
            let skip = items.len().saturating_sub(capacity);
            prop_assert_eq!(buf.to_vec(), items[skip..].to_vec());
        }

        #[test]
        fn bulk_matches_single_pushes(
            capacity in 0usize..32,
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..20), 0..10),
        ) {
            let mut bulk = CircularBuffer::new(capacity);
            let mut single = CircularBuffer::new(capacity);
            for chunk in &chunks {
                bulk.extend_bulk(chunk.iter().copied());
                for item in chunk {
                    single.push(*item);
                }
                prop_assert!(bulk.len() <= capacity);
            }
            prop_assert_eq!(bulk.to_vec(), single.to_vec());
        }
    }
}
