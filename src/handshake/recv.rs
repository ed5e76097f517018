use std::collections::VecDeque;
use std::ops::Range;

use super::collapse;
use crate::buffer::{Buf, BufferPool};
use crate::message::{FragmentHeader, MessageType};
use crate::Error;

/// Upper bound for one reassembled handshake message.
const MAX_MESSAGE_LEN: usize = 1 << 16;

#[derive(Debug)]
struct Partial {
    msg_type: MessageType,
    body: Buf,
    /// Bytes not received yet. Only shrinks from the edges.
    missing: Range<usize>,
    /// One out-of-order span inside `missing`, merged once an edge
    /// reaches it.
    island: Option<Range<usize>>,
}

/// A reassembled handshake message.
#[derive(Debug)]
pub(crate) struct Message {
    pub msg_type: MessageType,
    pub msg_seq: u16,
    pub body: Buf,
}

/// What happened to an incoming fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Absorbed {
    /// Extended the received span (or repeated data we have). Ack the record.
    Ack,
    /// Held back until the gap before it closes. Not acked.
    Pending,
    /// Part of a message that was already delivered.
    Delivered,
}

/// Reassembly of incoming handshake messages.
///
/// Slot `i` holds message `next_seq + i`. Messages are delivered strictly
/// in sequence.
#[derive(Debug)]
pub(crate) struct RecvQueue {
    next_seq: u32,
    slots: VecDeque<Option<Partial>>,
    pool: BufferPool,
}

impl RecvQueue {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0);
        RecvQueue {
            next_seq: 0,
            slots: (0..depth).map(|_| None).collect(),
            pool: BufferPool::default(),
        }
    }

    /// Sequence number of the next message to deliver.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Continue at `seq`, e.g. after a stateless retry consumed the first
    /// ClientHello.
    pub fn skip_to(&mut self, seq: u32) {
        while self.next_seq < seq {
            self.advance();
        }
    }

    /// Step past a message delivered outside the queue.
    pub fn advance(&mut self) {
        if let Some(Some(p)) = self.slots.pop_front() {
            self.pool.push(p.body);
        }
        self.slots.push_back(None);
        self.next_seq += 1;
    }

    /// Whether there is a partially received message waiting.
    pub fn has_partial(&self) -> bool {
        self.slots.iter().any(|s| s.is_some())
    }

    pub fn absorb(&mut self, header: &FragmentHeader, data: &[u8]) -> Result<Absorbed, Error> {
        let seq = header.message_seq as u32;
        if seq < self.next_seq {
            return Ok(Absorbed::Delivered);
        }
        let index = (seq - self.next_seq) as usize;
        if index >= self.slots.len() {
            return Err(Error::FragmentOutOfWindow);
        }

        let length = header.length as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(Error::RecordDropped("handshake message too long"));
        }

        let slot = &mut self.slots[index];
        if slot.is_none() {
            let mut body = self.pool.pop();
            body.resize(length, 0);
            *slot = Some(Partial {
                msg_type: header.msg_type,
                body,
                missing: 0..length,
                island: None,
            });
        }
        let Some(partial) = slot.as_mut() else {
            unreachable!("slot filled above");
        };
        if partial.msg_type != header.msg_type || partial.body.len() != length {
            return Err(Error::RecordDropped("fragment disagrees with message"));
        }

        if partial.missing.is_empty() {
            return Ok(Absorbed::Ack);
        }

        let offset = header.fragment_offset as usize;
        let range = offset..offset + data.len();

        // Never overwrite bytes that are already in place.
        let island = partial.island.clone().unwrap_or(0..0);
        for part in subtract(intersect(&range, &partial.missing), &island) {
            let from = part.start - offset..part.end - offset;
            partial.body[part].copy_from_slice(&data[from]);
        }

        if collapse(&mut partial.missing, &range) {
            if let Some(island) = partial.island.take() {
                if !collapse(&mut partial.missing, &island) && !partial.missing.is_empty() {
                    partial.island = Some(island);
                }
            }
            return Ok(Absorbed::Ack);
        }

        if range.is_empty() {
            return Ok(Absorbed::Pending);
        }
        if intersect(&range, &partial.missing).is_empty() {
            // Everything in it is already in place.
            return Ok(Absorbed::Ack);
        }

        partial.island = match partial.island.take() {
            None => Some(range),
            Some(island) if range.start <= island.end && island.start <= range.end => {
                Some(island.start.min(range.start)..island.end.max(range.end))
            }
            // A second gap. Keep the first island, the peer will resend.
            Some(island) => Some(island),
        };
        Ok(Absorbed::Pending)
    }

    /// Whether the next message in sequence is complete.
    pub fn is_ready(&self) -> bool {
        matches!(self.slots.front(), Some(Some(p)) if p.missing.is_empty())
    }

    /// Take the next message if it is complete.
    pub fn pop(&mut self) -> Option<Message> {
        if !self.is_ready() {
            return None;
        }
        let partial = self.slots.pop_front().flatten()?;
        self.slots.push_back(None);
        let msg_seq = self.next_seq as u16;
        self.next_seq += 1;
        Some(Message {
            msg_type: partial.msg_type,
            msg_seq,
            body: partial.body,
        })
    }

    /// Hand a delivered message body back for reuse.
    pub fn recycle(&mut self, body: Buf) {
        self.pool.push(body);
    }
}

fn intersect(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    start..end.max(start)
}

/// `a` without `b`, as up to two ranges.
fn subtract(a: Range<usize>, b: &Range<usize>) -> impl Iterator<Item = Range<usize>> {
    let left = a.start..a.end.min(b.start);
    let right = a.start.max(b.end)..a.end;
    [left, right].into_iter().filter(|r| r.start < r.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16, length: u32, offset: u32, len: u32) -> FragmentHeader {
        FragmentHeader {
            msg_type: MessageType::Certificate,
            length,
            message_seq: seq,
            fragment_offset: offset,
            fragment_length: len,
        }
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn feed(q: &mut RecvQueue, seq: u16, msg: &[u8], r: Range<usize>) -> Absorbed {
        let h = header(seq, msg.len() as u32, r.start as u32, r.len() as u32);
        q.absorb(&h, &msg[r]).unwrap()
    }

    #[test]
    fn in_order_fragments() {
        let msg = message(100);
        let mut q = RecvQueue::new(4);
        assert_eq!(feed(&mut q, 0, &msg, 0..40), Absorbed::Ack);
        assert!(q.pop().is_none());
        assert_eq!(feed(&mut q, 0, &msg, 40..100), Absorbed::Ack);
        let m = q.pop().unwrap();
        assert_eq!(m.msg_seq, 0);
        assert_eq!(&m.body[..], &msg[..]);
        assert_eq!(q.next_seq(), 1);
    }

    #[test]
    fn tail_first_then_head() {
        let msg = message(100);
        let mut q = RecvQueue::new(4);
        assert_eq!(feed(&mut q, 0, &msg, 60..100), Absorbed::Ack);
        assert_eq!(feed(&mut q, 0, &msg, 0..60), Absorbed::Ack);
        assert_eq!(&q.pop().unwrap().body[..], &msg[..]);
    }

    #[test]
    fn island_merges_when_gap_closes() {
        let msg = message(90);
        let mut q = RecvQueue::new(4);
        assert_eq!(feed(&mut q, 0, &msg, 30..60), Absorbed::Pending);
        assert_eq!(feed(&mut q, 0, &msg, 0..30), Absorbed::Ack);
        assert!(!q.is_ready());
        assert_eq!(feed(&mut q, 0, &msg, 60..90), Absorbed::Ack);
        assert_eq!(&q.pop().unwrap().body[..], &msg[..]);
    }

    #[test]
    fn duplicates_do_not_change_body() {
        let msg = message(50);
        let mut q = RecvQueue::new(4);
        feed(&mut q, 0, &msg, 0..25);

        // Same range, different bytes: the first copy wins.
        let h = header(0, 50, 0, 25);
        assert_eq!(q.absorb(&h, &[0xff; 25]).unwrap(), Absorbed::Ack);

        feed(&mut q, 0, &msg, 25..50);
        assert_eq!(&q.pop().unwrap().body[..], &msg[..]);
    }

    #[test]
    fn repeat_below_received_edge_keeps_island() {
        let msg = message(100);
        let mut q = RecvQueue::new(4);
        assert_eq!(feed(&mut q, 0, &msg, 0..40), Absorbed::Ack);
        assert_eq!(feed(&mut q, 0, &msg, 60..80), Absorbed::Pending);

        // A resend of bytes already held is acked and changes nothing.
        assert_eq!(feed(&mut q, 0, &msg, 0..25), Absorbed::Ack);
        assert_eq!(feed(&mut q, 0, &msg, 10..40), Absorbed::Ack);

        // The island survived: closing the gap up to it merges it.
        assert_eq!(feed(&mut q, 0, &msg, 40..60), Absorbed::Ack);
        assert!(!q.is_ready());
        assert_eq!(feed(&mut q, 0, &msg, 80..100), Absorbed::Ack);
        assert_eq!(&q.pop().unwrap().body[..], &msg[..]);
    }

    #[test]
    fn deliverable_exactly_when_covered() {
        let msg = message(64);
        let pieces = [16..32, 48..64, 0..16, 32..48];
        let mut q = RecvQueue::new(4);
        // 16..32 island, 48..64 tail, 0..16 head merges island, 32..48 last.
        for r in pieces {
            assert!(!q.is_ready());
            feed(&mut q, 0, &msg, r);
        }
        assert!(q.is_ready());
        assert_eq!(&q.pop().unwrap().body[..], &msg[..]);
    }

    #[test]
    fn future_messages_wait_for_head() {
        let a = message(10);
        let b = message(20);
        let mut q = RecvQueue::new(4);
        feed(&mut q, 1, &b, 0..20);
        assert!(q.pop().is_none());
        feed(&mut q, 0, &a, 0..10);
        assert_eq!(q.pop().unwrap().msg_seq, 0);
        assert_eq!(q.pop().unwrap().msg_seq, 1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn window_bounds() {
        let msg = message(10);
        let mut q = RecvQueue::new(2);
        let h = header(2, 10, 0, 10);
        assert!(matches!(q.absorb(&h, &msg), Err(Error::FragmentOutOfWindow)));

        feed(&mut q, 0, &msg, 0..10);
        q.pop().unwrap();
        assert_eq!(feed(&mut q, 0, &msg, 0..10), Absorbed::Delivered);
    }

    #[test]
    fn inconsistent_fragment_dropped() {
        let msg = message(10);
        let mut q = RecvQueue::new(2);
        feed(&mut q, 0, &msg, 0..5);
        let h = header(0, 11, 5, 5);
        assert!(matches!(q.absorb(&h, &msg[5..]), Err(Error::RecordDropped(_))));
    }

    #[test]
    fn skip_after_stateless_retry() {
        let mut q = RecvQueue::new(2);
        q.skip_to(2);
        assert_eq!(q.next_seq(), 2);
        let msg = message(4);
        assert_eq!(feed(&mut q, 1, &msg, 0..4), Absorbed::Delivered);
    }
}
