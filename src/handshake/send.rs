use std::ops::Range;

use arrayvec::ArrayVec;

use super::collapse;
use crate::buffer::{Buf, BufferPool};
use crate::containers::RingBuffer;
use crate::message::MessageType;
use crate::record::RecordNumber;

/// Smallest fragment body worth sending when the message doesn't end there.
pub(crate) const MIN_FRAGMENT: usize = 32;

/// Longest flight: ServerHello, EncryptedExtensions, Certificate,
/// CertificateVerify, Finished.
const MAX_FLIGHT_LEN: usize = 5;

/// Records remembered for mapping ACKs back to fragments.
const SENT_LOG_LEN: usize = 64;

#[derive(Debug)]
struct Outgoing {
    msg_type: MessageType,
    msg_seq: u16,
    epoch: u16,
    body: Buf,
    /// Bytes not yet acknowledged.
    unacked: Range<usize>,
}

#[derive(Debug, Clone)]
struct SentFragment {
    record: RecordNumber,
    index: usize,
    range: Range<usize>,
}

/// One fragment to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub index: usize,
    pub msg_type: MessageType,
    pub msg_seq: u16,
    pub epoch: u16,
    pub length: usize,
    pub range: Range<usize>,
}

/// The current outgoing flight.
///
/// Starting a new flight replaces the previous one wholesale. Sending
/// happens in passes: [`SendQueue::rewind`] starts a pass over everything
/// still unacknowledged and [`SendQueue::next_fragment`] hands out the
/// pieces in order.
#[derive(Debug)]
pub(crate) struct SendQueue {
    flight: u8,
    messages: ArrayVec<Outgoing, MAX_FLIGHT_LEN>,
    sent: RingBuffer<SentFragment>,
    /// (message index, offset) of the next fragment in the current pass.
    cursor: Option<(usize, usize)>,
    pool: BufferPool,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            flight: 0,
            messages: ArrayVec::new(),
            sent: RingBuffer::new(SENT_LOG_LEN),
            cursor: None,
            pool: BufferPool::default(),
        }
    }

    pub fn flight(&self) -> u8 {
        self.flight
    }

    /// Drop the current flight and start `flight`.
    pub fn begin_flight(&mut self, flight: u8) {
        debug!("Begin flight {}", flight);
        self.clear();
        self.flight = flight;
    }

    /// Forget the current flight, it is implicitly or explicitly acked.
    pub fn clear(&mut self) {
        for m in self.messages.drain(..) {
            self.pool.push(m.body);
        }
        self.sent.clear();
        self.cursor = None;
    }

    /// Buffer for building a message body.
    pub fn buffer(&mut self) -> Buf {
        self.pool.pop()
    }

    /// Append a message to the current flight.
    pub fn push(&mut self, msg_type: MessageType, msg_seq: u16, epoch: u16, body: Buf) {
        assert!(!body.is_empty(), "empty handshake message");
        assert!(!self.messages.is_full(), "flight too long");
        trace!(
            "Queue {:?} seq {} epoch {} ({} bytes)",
            msg_type,
            msg_seq,
            epoch,
            body.len()
        );
        let unacked = 0..body.len();
        self.messages.push(Outgoing {
            msg_type,
            msg_seq,
            epoch,
            body,
            unacked,
        });
    }

    pub fn has_flight(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Every message of the flight is acknowledged.
    pub fn is_acked(&self) -> bool {
        self.messages.iter().all(|m| m.unacked.is_empty())
    }

    /// Start a (re)transmission pass.
    pub fn rewind(&mut self) {
        self.cursor = self
            .messages
            .iter()
            .position(|m| !m.unacked.is_empty())
            .map(|i| (i, self.messages[i].unacked.start));
    }

    /// Whether the current pass has fragments left.
    pub fn has_pending(&self) -> bool {
        self.position().is_some()
    }

    /// Epoch of the message the pass continues with.
    pub fn pending_epoch(&self) -> Option<u16> {
        self.position().map(|(index, _)| self.messages[index].epoch)
    }

    /// Where the pass continues. Messages with nothing left to send, either
    /// fully handed out or acked since, are skipped.
    fn position(&self) -> Option<(usize, usize)> {
        let (index, offset) = self.cursor?;
        let m = self.messages.get(index)?;
        let start = offset.max(m.unacked.start);
        if start < m.unacked.end {
            return Some((index, start));
        }
        self.messages
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, m)| !m.unacked.is_empty())
            .map(|(i, m)| (i, m.unacked.start))
    }

    /// Next fragment of the pass with at most `max_body` bytes.
    ///
    /// `None` when the pass is done or the space left is too small for a
    /// sensible fragment.
    pub fn next_fragment(&mut self, max_body: usize) -> Option<Fragment> {
        let Some((index, start)) = self.position() else {
            self.cursor = None;
            return None;
        };
        let m = &self.messages[index];

        let remaining = m.unacked.end - start;
        let len = remaining.min(max_body);
        if len == 0 || (len < remaining && len < MIN_FRAGMENT) {
            self.cursor = Some((index, start));
            return None;
        }

        self.cursor = Some((index, start + len));
        Some(Fragment {
            index,
            msg_type: m.msg_type,
            msg_seq: m.msg_seq,
            epoch: m.epoch,
            length: m.body.len(),
            range: start..start + len,
        })
    }

    pub fn body(&self, index: usize) -> &[u8] {
        &self.messages[index].body
    }

    /// Remember which record carried `fragment`.
    pub fn record_sent(&mut self, fragment: &Fragment, record: RecordNumber) {
        self.sent.push_overwrite(SentFragment {
            record,
            index: fragment.index,
            range: fragment.range.clone(),
        });
    }

    /// Apply an ACK for `record`. Returns true if it acknowledged anything.
    pub fn ack(&mut self, record: RecordNumber) -> bool {
        let mut changed = false;
        for s in self.sent.iter().filter(|s| s.record == record) {
            if let Some(m) = self.messages.get_mut(s.index) {
                changed |= collapse(&mut m.unacked, &s.range);
            }
        }
        if changed && self.is_acked() {
            debug!("Flight {} acked", self.flight);
        }
        changed
    }
}
