//! Fixed-capacity building blocks for queues and timers.

mod heap;
mod ring;

pub use heap::IndexHeap;
pub use ring::RingBuffer;
