//! Fixed-capacity FIFO ring buffer.
//!
//! Storage is allocated once in [`RingBuffer::new`]; pushing never
//! allocates. Not synchronized, callers wrap it in their own lock.

use std::fmt;

pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring holding at most `capacity` items.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let slots = (0..capacity).map(|_| None).collect();
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Append `item`. Gives it back if the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let tail = self.index(self.len);
        self.slots[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Append `item`, evicting and returning the oldest entry when full.
    pub fn push_overwrite(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop() } else { None };
        if self.push(item).is_err() {
            unreachable!("ring has room after eviction");
        }
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = self.index(1);
        self.len -= 1;
        item
    }

    pub fn peek(&self) -> Option<&T> {
        self.get(0)
    }

    /// Item at logical position `i`, 0 being the oldest.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.len {
            return None;
        }
        self.slots[self.index(i)].as_ref()
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        if i >= self.len {
            return None;
        }
        let idx = self.index(i);
        self.slots[idx].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut r = RingBuffer::new(3);
        r.push(1).unwrap();
        r.push(2).unwrap();
        assert_eq!(r.pop(), Some(1));
        r.push(3).unwrap();
        r.push(4).unwrap();
        assert!(r.is_full());
        assert_eq!(r.push(5), Err(5));
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.pop(), Some(3));
        assert_eq!(r.pop(), Some(4));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn overwrite_evicts_oldest() {
        let mut r = RingBuffer::new(2);
        assert_eq!(r.push_overwrite('a'), None);
        assert_eq!(r.push_overwrite('b'), None);
        assert_eq!(r.push_overwrite('c'), Some('a'));
        assert_eq!(r.peek(), Some(&'b'));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn wraps_many_times() {
        let mut r = RingBuffer::new(4);
        for i in 0..100 {
            r.push(i).unwrap();
            if r.len() == 3 {
                assert_eq!(r.pop(), Some(i - 2));
            }
        }
        assert_eq!(r.get(0), Some(&98));
        assert_eq!(r.get(1), Some(&99));
        assert_eq!(r.get(2), None);
    }

    #[test]
    fn clear_empties() {
        let mut r = RingBuffer::new(2);
        r.push(1).unwrap();
        r.push(2).unwrap();
        r.clear();
        assert!(r.is_empty());
        r.push(3).unwrap();
        assert_eq!(r.pop(), Some(3));
    }
}
