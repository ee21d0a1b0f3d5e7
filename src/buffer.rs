//! Bounded MPMC ring buffer of opaque records.

use parking_lot::Mutex;

struct Inner<T> {
    items: Vec<Option<T>>,
    capacity: usize,
    write: usize,
    read: usize,
}

/// A fixed-capacity FIFO ring buffer, safe for concurrent push/pop.
///
/// Usable capacity is `capacity - 1`: one slot is reserved so that `read ==
/// write` unambiguously means empty rather than also meaning full.
pub struct CircularBuffer<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> CircularBuffer<T> {
    /// Build a new ring buffer. `capacity` must be at least 2.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "capacity must be > 1");
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Inner {
                items,
                capacity,
                write: 0,
                read: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.read == inner.write
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        is_full(&inner)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        len(&inner)
    }

    pub fn available_capacity(&self) -> usize {
        let inner = self.inner.lock();
        inner.capacity - len(&inner) - 1
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.write = 0;
        inner.read = 0;
        for slot in inner.items.iter_mut() {
            *slot = None;
        }
    }

    /// Push a single item. Returns `false` if the buffer is full.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if is_full(&inner) {
            return false;
        }
        let idx = inner.write;
        inner.items[idx] = Some(item);
        inner.write = (inner.write + 1) % inner.capacity;
        true
    }

    /// Push as many items as fit, preserving order. Returns the count
    /// actually stored and hands back any items that didn't fit.
    pub fn push_items(&self, mut items: Vec<T>) -> (usize, Vec<T>) {
        let mut inner = self.inner.lock();
        if is_full(&inner) {
            return (0, items);
        }

        let available = inner.capacity - len(&inner) - 1;
        let to_push = items.len().min(available);

        let remainder = items.split_off(to_push);
        for item in items {
            let idx = inner.write;
            inner.items[idx] = Some(item);
            inner.write = (inner.write + 1) % inner.capacity;
        }

        (to_push, remainder)
    }

    /// Pop the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.read == inner.write {
            return None;
        }
        let idx = inner.read;
        inner.read = (inner.read + 1) % inner.capacity;
        inner.items[idx].take()
    }
}

fn is_full<T>(inner: &Inner<T>) -> bool {
    (inner.write + 1) % inner.capacity == inner.read
}

fn len<T>(inner: &Inner<T>) -> usize {
    if inner.write >= inner.read {
        inner.write - inner.read
    } else {
        inner.capacity - inner.read + inner.write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_two_holds_exactly_one() {
        let buf = CircularBuffer::new(2);
        assert!(buf.push(1));
        assert!(!buf.push(2));
        assert_eq!(buf.pop(), Some(1));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn fifo_ordering_across_wraparound() {
        let buf = CircularBuffer::new(3);
        assert!(buf.push(1));
        assert!(buf.push(2));
        assert_eq!(buf.pop(), Some(1));
        assert_eq!(buf.pop(), Some(2));
        assert_eq!(buf.pop(), None);
        assert!(buf.push(3));
        assert_eq!(buf.pop(), Some(3));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn is_empty_and_is_full_track_len() {
        let buf = CircularBuffer::new(3);
        assert!(buf.is_empty());
        assert!(!buf.is_full());
        buf.push(1);
        buf.push(2);
        assert!(!buf.is_empty());
        assert!(buf.is_full());
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.available_capacity(), 0);
    }

    #[test]
    fn push_items_partial_fill_returns_remainder() {
        let buf = CircularBuffer::new(4); // usable capacity 3
        let (pushed, remainder) = buf.push_items(vec![1, 2, 3, 4, 5]);
        assert_eq!(pushed, 3);
        assert_eq!(remainder, vec![4, 5]);
        assert_eq!(buf.pop(), Some(1));
        assert_eq!(buf.pop(), Some(2));
        assert_eq!(buf.pop(), Some(3));
    }

    #[test]
    fn push_items_on_full_buffer_stores_nothing() {
        let buf = CircularBuffer::new(2);
        assert!(buf.push(1));
        let (pushed, remainder) = buf.push_items(vec![2, 3]);
        assert_eq!(pushed, 0);
        assert_eq!(remainder, vec![2, 3]);
    }

    #[test]
    fn clear_resets_to_empty() {
        let buf = CircularBuffer::new(4);
        buf.push(1);
        buf.push(2);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.pop(), None);
    }
}
