//! Index-based binary min-heap.
//!
//! Entries are identified by a dense id in `0..capacity` (a slab index), so
//! rescheduling or removing an entry is O(log n) without storing a handle
//! inside the entry itself. A position map gives the heap slot for each id.

const ABSENT: usize = usize::MAX;

#[derive(Debug)]
pub struct IndexHeap<K> {
    /// Heap-ordered ids.
    heap: Vec<usize>,
    /// id -> position in `heap`, or `ABSENT`.
    pos: Vec<usize>,
    /// id -> key, valid only while the id is present.
    keys: Vec<Option<K>>,
}

impl<K: Ord + Copy> IndexHeap<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            pos: vec![ABSENT; capacity],
            keys: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.pos.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.pos.get(id).is_some_and(|p| *p != ABSENT)
    }

    pub fn key(&self, id: usize) -> Option<K> {
        self.keys.get(id).copied().flatten()
    }

    /// Insert `id` with `key`, or move it to `key` if already present.
    ///
    /// Panics if `id` is outside the capacity.
    pub fn set(&mut self, id: usize, key: K) {
        assert!(id < self.capacity(), "heap id {} out of range", id);
        let old = self.keys[id].replace(key);
        match old {
            None => {
                self.pos[id] = self.heap.len();
                self.heap.push(id);
                self.sift_up(self.heap.len() - 1);
            }
            Some(old) if key < old => self.sift_up(self.pos[id]),
            Some(_) => self.sift_down(self.pos[id]),
        }
    }

    /// Insert `id`, or move it to the later of `key` and its current key.
    ///
    /// Keys only move forward this way, which keeps frequent resets cheap.
    /// Returns the effective key.
    pub fn set_later(&mut self, id: usize, key: K) -> K {
        let effective = match self.key(id) {
            Some(current) if current > key => current,
            _ => key,
        };
        self.set(id, effective);
        effective
    }

    /// Smallest entry without removing it.
    pub fn peek(&self) -> Option<(usize, K)> {
        let id = *self.heap.first()?;
        Some((id, self.keys[id]?))
    }

    pub fn pop(&mut self) -> Option<(usize, K)> {
        let (id, key) = self.peek()?;
        self.remove(id);
        Some((id, key))
    }

    /// Remove `id`. Returns its key if it was present.
    pub fn remove(&mut self, id: usize) -> Option<K> {
        if !self.contains(id) {
            return None;
        }
        let p = self.pos[id];
        let last = self.heap.len() - 1;
        self.swap(p, last);
        self.heap.pop();
        self.pos[id] = ABSENT;
        let key = self.keys[id].take();

        if p < self.heap.len() {
            self.sift_down(p);
            self.sift_up(p);
        }
        key
    }

    fn key_at(&self, p: usize) -> K {
        match self.keys[self.heap[p]] {
            Some(k) => k,
            None => unreachable!("heap slot without key"),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos[self.heap[a]] = a;
        self.pos[self.heap[b]] = b;
    }

    fn sift_up(&mut self, mut p: usize) {
        while p > 0 {
            let parent = (p - 1) / 2;
            if self.key_at(p) >= self.key_at(parent) {
                break;
            }
            self.swap(p, parent);
            p = parent;
        }
    }

    fn sift_down(&mut self, mut p: usize) {
        let n = self.heap.len();
        loop {
            let l = 2 * p + 1;
            let r = l + 1;
            let mut smallest = p;
            if l < n && self.key_at(l) < self.key_at(smallest) {
                smallest = l;
            }
            if r < n && self.key_at(r) < self.key_at(smallest) {
                smallest = r;
            }
            if smallest == p {
                break;
            }
            self.swap(p, smallest);
            p = smallest;
        }
    }
}
