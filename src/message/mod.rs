//! Wire codecs for handshake messages, alerts and acks.
//!
//! Parsers borrow from the input. Writers append to a [`Buf`] and backfill
//! length prefixes once the body is known.

mod ack;
mod alert;
mod certificate;
mod client_hello;
mod extensions;
mod handshake;
mod post_handshake;
mod server_hello;

pub use ack::{parse_ack, write_ack, MAX_ACK_ENTRIES};
pub use alert::{Alert, AlertDescription, AlertLevel};
pub use certificate::{Certificate, CertificateVerify, MAX_CHAIN_LEN};
pub use client_hello::{ClientHello, OfferedPsk};
pub use extensions::ExtensionType;
pub use handshake::{FragmentHeader, MessageType, FRAGMENT_HEADER_LEN};
pub use post_handshake::{EncryptedExtensions, KeyUpdate, NewSessionTicket};
pub use server_hello::{ServerHello, HRR_RANDOM};

use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;
use crate::Error;

/// DTLS 1.3 in supported_versions.
pub const DTLS1_3: u16 = 0xfefc;

/// Legacy version field of the hellos.
pub const DTLS1_2: u16 = 0xfefd;

/// Parse a whole handshake body, rejecting trailing bytes.
pub(crate) fn decode<'a, T>(
    input: &'a [u8],
    parser: impl FnOnce(&'a [u8]) -> IResult<&'a [u8], T>,
    what: &'static str,
) -> Result<T, Error> {
    match parser(input) {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        Ok(_) => Err(Error::DecodeError(format!("{}: trailing bytes", what))),
        Err(e) => Err(Error::DecodeError(format!("{}: {:?}", what, e))),
    }
}

pub(crate) fn vec8(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u8(input)?;
    take(len as usize)(input)
}

pub(crate) fn vec16(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u16(input)?;
    take(len as usize)(input)
}

pub(crate) fn vec24(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u24(input)?;
    take(len as usize)(input)
}

/// Fail unless `input` is fully consumed.
pub(crate) fn all_consumed(input: &[u8]) -> IResult<&[u8], ()> {
    if input.is_empty() {
        Ok((input, ()))
    } else {
        Err(Err::Error(NomError::new(input, ErrorKind::Eof)))
    }
}

pub(crate) fn write_vec8(out: &mut Buf, data: &[u8]) {
    assert!(data.len() <= u8::MAX as usize);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

pub(crate) fn write_vec16(out: &mut Buf, data: &[u8]) {
    assert!(data.len() <= u16::MAX as usize);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

/// Write a u16 length prefix around whatever `f` appends.
pub(crate) fn with_len16(out: &mut Buf, f: impl FnOnce(&mut Buf)) {
    let at = out.len();
    out.extend_from_slice(&[0, 0]);
    f(out);
    let len = out.len() - at - 2;
    assert!(len <= u16::MAX as usize);
    out.set_u16(at, len as u16);
}

/// Write a u8 length prefix around whatever `f` appends.
pub(crate) fn with_len8(out: &mut Buf, f: impl FnOnce(&mut Buf)) {
    let at = out.len();
    out.push(0);
    f(out);
    let len = out.len() - at - 1;
    assert!(len <= u8::MAX as usize);
    out[at] = len as u8;
}

/// Write a u24 length prefix around whatever `f` appends.
pub(crate) fn with_len24(out: &mut Buf, f: impl FnOnce(&mut Buf)) {
    let at = out.len();
    out.extend_from_slice(&[0, 0, 0]);
    f(out);
    let len = out.len() - at - 3;
    assert!(len < 1 << 24);
    out.set_u24(at, len as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixes() {
        let mut out = Buf::new();
        with_len16(&mut out, |o| {
            write_vec8(o, b"ab");
            with_len24(o, |o| o.push(9));
        });
        assert_eq!(&out[..], &[0, 7, 2, b'a', b'b', 0, 0, 1, 9]);

        let (rest, body) = vec16(&out).unwrap();
        assert!(rest.is_empty());
        let (rest, ab) = vec8(body).unwrap();
        assert_eq!(ab, b"ab");
        assert_eq!(vec24(rest).unwrap().1, &[9]);
    }

    #[test]
    fn decode_rejects_trailing() {
        let r = decode(&[1, 2][..], be_u8, "byte");
        assert!(matches!(r, Err(Error::DecodeError(_))));
        assert_eq!(decode(&[1][..], be_u8, "byte").unwrap(), 1);
    }
}
