//! AEAD protection of DTLSCiphertext records.
//!
//! ```text
//! inner  = content || type || 0x00 * padding
//! header = flags || seq16 || length        (AAD, unmasked)
//! wire   = header ^ sn_mask || AEAD(inner) || tag
//! ```

use std::ops::Range;

use super::header::{ciphertext_header, ContentType, CIPHERTEXT_HEADER_LEN};
use crate::buffer::Buf;
use crate::crypto::{SymmetricKeys, TAG_LEN};
use crate::Error;

/// Bytes of ciphertext sampled for the sequence number mask.
const SN_SAMPLE_LEN: usize = 16;

/// Wire size of a protected record carrying `content_len` bytes.
pub fn sealed_len(content_len: usize, padding: usize) -> usize {
    CIPHERTEXT_HEADER_LEN + padded_len(content_len + 1, padding) + TAG_LEN
}

/// Largest content that fits a protected record of at most `space` bytes.
pub fn max_content(space: usize, padding: usize) -> usize {
    let overhead = CIPHERTEXT_HEADER_LEN + 1 + TAG_LEN;
    if space <= overhead {
        return 0;
    }
    let mut n = space - overhead;
    while n > 0 && sealed_len(n, padding) > space {
        n -= 1;
    }
    n
}

fn padded_len(len: usize, padding: usize) -> usize {
    if padding <= 1 {
        len
    } else {
        len.div_ceil(padding) * padding
    }
}

/// Append one protected record to `out`.
#[allow(clippy::too_many_arguments)]
pub fn seal(
    out: &mut Buf,
    keys: &SymmetricKeys,
    epoch: u16,
    seq: u64,
    content_type: ContentType,
    content: &[u8],
    padding: usize,
    mask_sequence: bool,
) -> Result<(), Error> {
    let inner_len = padded_len(content.len() + 1, padding);
    let length = inner_len + TAG_LEN;
    assert!(length <= u16::MAX as usize, "record larger than 2^16");

    let header = ciphertext_header(epoch, seq, length as u16);
    let start = out.len();
    out.extend_from_slice(&header);

    let body_start = out.len();
    out.extend_from_slice(content);
    out.push(content_type.as_u8());
    out.resize(body_start + inner_len, 0);

    let tag = keys.seal(seq, &header, &mut out[body_start..])?;
    out.extend_from_slice(&tag);

    if mask_sequence {
        let mut sample = [0u8; SN_SAMPLE_LEN];
        sample.copy_from_slice(&out[body_start..body_start + SN_SAMPLE_LEN]);
        let mask = keys.sn_mask(&sample);
        out[start + 1] ^= mask[0];
        out[start + 2] ^= mask[1];
    }

    Ok(())
}

/// Remove the sequence number mask in place and return the wire bits.
///
/// Afterwards `datagram[header]` is the AAD for [`open`].
pub fn unmask_sequence(
    datagram: &mut [u8],
    header: &Range<usize>,
    body: &Range<usize>,
    seq_bits: u32,
    keys: &SymmetricKeys,
    mask_sequence: bool,
) -> Result<u64, Error> {
    if body.len() < SN_SAMPLE_LEN.max(TAG_LEN + 1) {
        return Err(Error::RecordDropped("ciphertext too short"));
    }
    let seq_len = (seq_bits / 8) as usize;
    let seq_at = header.start + 1;

    if mask_sequence {
        let mut sample = [0u8; SN_SAMPLE_LEN];
        sample.copy_from_slice(&datagram[body.start..body.start + SN_SAMPLE_LEN]);
        let mask = keys.sn_mask(&sample);
        for i in 0..seq_len {
            datagram[seq_at + i] ^= mask[i];
        }
    }

    let wire = datagram[seq_at..seq_at + seq_len]
        .iter()
        .fold(0u64, |acc, b| acc << 8 | *b as u64);
    Ok(wire)
}

/// Decrypt a record in place.
///
/// Returns the real content type and the range of the content within
/// `datagram`.
pub fn open(
    datagram: &mut [u8],
    header: &Range<usize>,
    body: &Range<usize>,
    seq: u64,
    keys: &SymmetricKeys,
) -> Result<(ContentType, Range<usize>), Error> {
    let mut aad = [0u8; CIPHERTEXT_HEADER_LEN];
    let aad_len = header.len();
    if aad_len > aad.len() {
        return Err(Error::RecordDropped("unexpected header length"));
    }
    aad[..aad_len].copy_from_slice(&datagram[header.clone()]);

    let tag_at = body.end - TAG_LEN;
    let (data, tag) = datagram[body.start..body.end].split_at_mut(tag_at - body.start);
    keys.open(seq, &aad[..aad_len], data, tag)?;

    // Strip padding, the last non-zero byte is the content type.
    let Some(type_at) = data.iter().rposition(|b| *b != 0) else {
        return Err(Error::RecordDropped("inner plaintext without content type"));
    };
    let content_type = ContentType::from_u8(data[type_at]);
    Ok((content_type, body.start..body.start + type_at))
}
