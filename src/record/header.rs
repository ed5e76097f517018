//! Record framing: DTLSPlaintext and the unified DTLSCiphertext header
//! (RFC 9147 §4).

use std::ops::Range;

use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;
use crate::util::be_u48;

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Ack,
    Unknown(u8),
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            26 => ContentType::Ack,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Ack => 26,
            ContentType::Unknown(v) => *v,
        }
    }
}

/// Unified header flag bits.
///
/// ```text
/// 0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |0|0|1|C|S|L|E E|
/// +-+-+-+-+-+-+-+-+
/// ```
pub mod flags {
    pub const FIXED: u8 = 0b0010_0000;
    pub const FIXED_MASK: u8 = 0b1110_0000;
    pub const CID: u8 = 0b0001_0000;
    pub const SEQ16: u8 = 0b0000_1000;
    pub const LENGTH: u8 = 0b0000_0100;
    pub const EPOCH: u8 = 0b0000_0011;
}

/// DTLSPlaintext header: type(1) version(2) epoch(2) seq(6) length(2).
pub const PLAINTEXT_HEADER_LEN: usize = 13;

/// Unified header as this engine writes it: flags(1) seq(2) length(2).
pub const CIPHERTEXT_HEADER_LEN: usize = 5;

const DTLS1_2: u16 = 0xfefd;
const DTLS1_0: u16 = 0xfeff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Plaintext {
        content_type: ContentType,
        epoch: u16,
        seq: u64,
    },
    Ciphertext {
        /// Low two bits of the epoch.
        epoch_bits: u8,
        /// 8 or 16.
        seq_bits: u32,
    },
}

/// One record located in a datagram.
///
/// Ranges index into the datagram buffer so the body can be decrypted in
/// place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: HeaderKind,
    pub header: Range<usize>,
    pub body: Range<usize>,
}

impl RecordHeader {
    pub fn is_ciphertext(first: u8) -> bool {
        first & flags::FIXED_MASK == flags::FIXED
    }

    /// Locate the next record in `input`.
    ///
    /// `base_offset` is the position of `input` in the datagram. A failure
    /// means the record boundary is lost and the rest of the datagram has to
    /// be discarded.
    pub fn parse(input: &[u8], base_offset: usize) -> IResult<&[u8], RecordHeader> {
        let Some(&first) = input.first() else {
            return Err(Err::Error(NomError::new(input, ErrorKind::Eof)));
        };
        if Self::is_ciphertext(first) {
            Self::parse_ciphertext(input, base_offset)
        } else {
            Self::parse_plaintext(input, base_offset)
        }
    }

    fn parse_plaintext(input: &[u8], base_offset: usize) -> IResult<&[u8], RecordHeader> {
        let original = input;
        let (input, content_type) = be_u8(input)?;
        let (input, version) = be_u16(input)?;
        if version != DTLS1_2 && version != DTLS1_0 {
            return Err(Err::Failure(NomError::new(input, ErrorKind::Tag)));
        }
        let (input, epoch) = be_u16(input)?;
        let (input, seq) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (rest, body) = take(length as usize)(input)?;

        let start = base_offset + offset_in(original, body);
        Ok((
            rest,
            RecordHeader {
                kind: HeaderKind::Plaintext {
                    content_type: ContentType::from_u8(content_type),
                    epoch,
                    seq,
                },
                header: base_offset..start,
                body: start..start + body.len(),
            },
        ))
    }

    fn parse_ciphertext(input: &[u8], base_offset: usize) -> IResult<&[u8], RecordHeader> {
        let original = input;
        let (input, first) = be_u8(input)?;

        // Without negotiated CIDs the CID length is unknown and so is the
        // record boundary.
        if first & flags::CID != 0 {
            return Err(Err::Failure(NomError::new(input, ErrorKind::Tag)));
        }

        let (input, seq_bits) = if first & flags::SEQ16 != 0 {
            let (input, _) = take(2usize)(input)?;
            (input, 16)
        } else {
            let (input, _) = take(1usize)(input)?;
            (input, 8)
        };

        let (rest, body) = if first & flags::LENGTH != 0 {
            let (input, length) = be_u16(input)?;
            take(length as usize)(input)?
        } else {
            take(input.len())(input)?
        };

        let start = base_offset + offset_in(original, body);
        Ok((
            rest,
            RecordHeader {
                kind: HeaderKind::Ciphertext {
                    epoch_bits: first & flags::EPOCH,
                    seq_bits,
                },
                header: base_offset..start,
                body: start..start + body.len(),
            },
        ))
    }
}

fn offset_in(outer: &[u8], inner: &[u8]) -> usize {
    inner.as_ptr() as usize - outer.as_ptr() as usize
}

/// Append a DTLSPlaintext record.
pub fn write_plaintext(out: &mut Buf, content_type: ContentType, seq: u64, fragment: &[u8]) {
    assert!(fragment.len() <= u16::MAX as usize);
    out.push(content_type.as_u8());
    out.extend_from_slice(&DTLS1_2.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes()[2..]);
    out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
    out.extend_from_slice(fragment);
}

/// Unified header with a 16 bit sequence number and a length.
pub fn ciphertext_header(epoch: u16, seq: u64, length: u16) -> [u8; CIPHERTEXT_HEADER_LEN] {
    let first = flags::FIXED | flags::SEQ16 | flags::LENGTH | (epoch as u8 & flags::EPOCH);
    let seq = (seq as u16).to_be_bytes();
    let len = length.to_be_bytes();
    [first, seq[0], seq[1], len[0], len[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_record() {
        let mut out = Buf::new();
        write_plaintext(&mut out, ContentType::Handshake, 7, b"hello");
        out.extend_from_slice(&[0xaa]);

        let (rest, rec) = RecordHeader::parse(&out, 0).unwrap();
        assert_eq!(rest, &[0xaa]);
        assert_eq!(
            rec.kind,
            HeaderKind::Plaintext {
                content_type: ContentType::Handshake,
                epoch: 0,
                seq: 7
            }
        );
        assert_eq!(rec.header, 0..PLAINTEXT_HEADER_LEN);
        assert_eq!(&out[rec.body], b"hello");
    }

    #[test]
    fn plaintext_rejects_unknown_version() {
        let mut out = Buf::new();
        write_plaintext(&mut out, ContentType::Handshake, 0, b"x");
        out[1] = 0x03;
        out[2] = 0x03;
        assert!(matches!(RecordHeader::parse(&out, 0), Err(Err::Failure(_))));
    }

    #[test]
    fn ciphertext_records_back_to_back() {
        let mut data = Vec::new();
        data.extend_from_slice(&ciphertext_header(3, 0x1234, 3));
        data.extend_from_slice(b"abc");
        data.extend_from_slice(&ciphertext_header(6, 1, 2));
        data.extend_from_slice(b"de");

        let (rest, a) = RecordHeader::parse(&data, 0).unwrap();
        assert_eq!(
            a.kind,
            HeaderKind::Ciphertext {
                epoch_bits: 3,
                seq_bits: 16
            }
        );
        assert_eq!(&data[a.header.clone()], &[0x2f, 0x12, 0x34, 0, 3]);
        assert_eq!(&data[a.body], b"abc");

        let offset = data.len() - rest.len();
        let (rest, b) = RecordHeader::parse(rest, offset).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            b.kind,
            HeaderKind::Ciphertext {
                epoch_bits: 2,
                seq_bits: 16
            }
        );
        assert_eq!(&data[b.body], b"de");
    }

    #[test]
    fn short_header_without_length_takes_rest() {
        // 8 bit seq, no length
        let data = [0x21, 0x05, 1, 2, 3, 4];
        let (rest, rec) = RecordHeader::parse(&data, 0).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            rec.kind,
            HeaderKind::Ciphertext {
                epoch_bits: 1,
                seq_bits: 8
            }
        );
        assert_eq!(rec.header, 0..2);
        assert_eq!(rec.body, 2..6);
    }

    #[test]
    fn cid_bit_loses_boundary() {
        let data = [0x3c, 0, 0, 0, 0];
        assert!(matches!(RecordHeader::parse(&data, 0), Err(Err::Failure(_))));
    }

    #[test]
    fn truncated_body_is_error() {
        let mut data = ciphertext_header(2, 0, 10).to_vec();
        data.extend_from_slice(b"abc");
        assert!(RecordHeader::parse(&data, 0).is_err());
    }
}
