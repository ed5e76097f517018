use std::fmt;

/// Largest sequence number a record can carry.
pub const MAX_SEQ: u64 = (1 << 48) - 1;

/// Epoch and sequence number of a record packed as `epoch << 48 | seq`.
///
/// Ordering is by epoch first, then sequence, which is the order the peer
/// sent the records in. Used as ack currency and to identify the record a
/// post-handshake message went out in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordNumber(u64);

impl RecordNumber {
    /// Panics if `seq` does not fit in 48 bits.
    pub fn new(epoch: u16, seq: u64) -> Self {
        assert!(seq <= MAX_SEQ, "sequence number exceeds 48 bits");
        RecordNumber((epoch as u64) << 48 | seq)
    }

    pub fn epoch(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn seq(&self) -> u64 {
        self.0 & MAX_SEQ
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The full sequence number closest to `expected` whose low `bits` bits
    /// equal `wire`.
    ///
    /// Ties go to the smaller candidate. Candidates outside `0..=MAX_SEQ` are
    /// never chosen.
    pub fn reconstruct(expected: u64, wire: u64, bits: u32) -> u64 {
        debug_assert!(bits == 8 || bits == 16);
        let win = 1u64 << bits;
        let hwin = win / 2;
        let mask = win - 1;

        let candidate = (expected & !mask) | (wire & mask);

        if candidate + hwin < expected && candidate + win <= MAX_SEQ {
            candidate + win
        } else if candidate >= expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

impl fmt::Debug for RecordNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch(), self.seq())
    }
}

impl fmt::Display for RecordNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
