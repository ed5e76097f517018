use arrayvec::ArrayVec;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::be_u64;
use nom::{Err, IResult};

use super::{vec16, with_len16};
use crate::buffer::Buf;
use crate::record::{RecordNumber, MAX_SEQ};

/// Record numbers carried in one ACK.
pub const MAX_ACK_ENTRIES: usize = 64;

/// ACK body (RFC 9147 §7): `RecordNumber record_numbers<0..2^16-1>` where
/// each entry is epoch(8) sequence(8).
pub fn parse_ack(input: &[u8]) -> IResult<&[u8], ArrayVec<RecordNumber, MAX_ACK_ENTRIES>> {
    let (rest, mut list) = vec16(input)?;
    if list.len() % 16 != 0 {
        return Err(Err::Error(NomError::new(list, ErrorKind::LengthValue)));
    }

    let mut out = ArrayVec::new();
    while !list.is_empty() {
        let (r, epoch) = be_u64(list)?;
        let (r, seq) = be_u64(r)?;
        if epoch > u16::MAX as u64 || seq > MAX_SEQ {
            return Err(Err::Error(NomError::new(list, ErrorKind::Verify)));
        }
        // More than we track is not an error, the sender will repeat.
        let _ = out.try_push(RecordNumber::new(epoch as u16, seq));
        list = r;
    }

    Ok((rest, out))
}

pub fn write_ack(out: &mut Buf, records: &[RecordNumber]) {
    with_len16(out, |o| {
        for rn in records {
            o.extend_from_slice(&(rn.epoch() as u64).to_be_bytes());
            o.extend_from_slice(&rn.seq().to_be_bytes());
        }
    });
}
