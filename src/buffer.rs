//! Buffer management for memory reuse.
//!
//! [`Buf`] wraps `Vec<u8>` with the handful of operations the record and
//! handshake layers need. [`BufferPool`] recycles them on the per-connection
//! hot path, while [`BoundedPool`] hands out a fixed number of buffers and
//! refuses beyond that, which is what the stateless retry path relies on.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Buffer pool for reusing allocated buffers.
///
/// Grows on demand. Buffers are cleared when returned.
#[derive(Default)]
pub struct BufferPool {
    free: VecDeque<Buf>,
}

impl BufferPool {
    /// Take a buffer from the pool, allocating if none is free.
    pub fn pop(&mut self) -> Buf {
        self.free.pop_front().unwrap_or_default()
    }

    /// Return a buffer to the pool.
    pub fn push(&mut self, mut buffer: Buf) {
        buffer.clear();
        self.free.push_front(buffer);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.free.len())
            .finish()
    }
}

/// Pool with a hard cap on the number of outstanding buffers.
///
/// All buffers are allocated up front with `capacity` bytes reserved.
/// `pop` returns `None` when every buffer is lent out.
pub struct BoundedPool {
    free: Vec<Buf>,
    total: usize,
}

impl BoundedPool {
    pub fn new(count: usize, capacity: usize) -> Self {
        let free = (0..count).map(|_| Buf::with_capacity(capacity)).collect();
        Self { free, total: count }
    }

    pub fn pop(&mut self) -> Option<Buf> {
        self.free.pop()
    }

    pub fn push(&mut self, mut buffer: Buf) {
        buffer.clear();
        // A foreign buffer would let the pool grow past its bound.
        if self.free.len() < self.total {
            self.free.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("free", &self.free.len())
            .field("total", &self.total)
            .finish()
    }
}

/// Growable byte buffer.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Buf(Vec<u8>);

impl Buf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buf(Vec::with_capacity(capacity))
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Buf(data.to_vec())
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn extend_from_slice(&mut self, other: &[u8]) {
        self.0.extend_from_slice(other);
    }

    pub fn push(&mut self, byte: u8) {
        self.0.push(byte);
    }

    pub fn resize(&mut self, len: usize, value: u8) {
        self.0.resize(len, value);
    }

    /// Truncate the buffer to `len`. No effect if `len` is past the end.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }

    /// Overwrite a big-endian u16 at `pos`, used to backfill length fields.
    pub fn set_u16(&mut self, pos: usize, value: u16) {
        self.0[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Overwrite a big-endian u24 at `pos`.
    pub fn set_u24(&mut self, pos: usize, value: u32) {
        self.0[pos..pos + 3].copy_from_slice(&value.to_be_bytes()[1..]);
    }
}

impl<'a> Extend<&'a u8> for Buf {
    fn extend<T: IntoIterator<Item = &'a u8>>(&mut self, iter: T) {
        self.0.extend(iter.into_iter().copied());
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Buf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl From<Vec<u8>> for Buf {
    fn from(value: Vec<u8>) -> Self {
        Buf(value)
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf").field("len", &self.0.len()).finish()
    }
}
