use arrayvec::ArrayVec;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::be_u16;
use nom::{Err, IResult};

use super::{vec16, with_len16};
use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionType {
    ServerName,
    SupportedGroups,
    SignatureAlgorithms,
    ApplicationLayerProtocolNegotiation,
    PreSharedKey,
    EarlyData,
    SupportedVersions,
    Cookie,
    PskKeyExchangeModes,
    KeyShare,
    Unknown(u16),
}

impl ExtensionType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ExtensionType::ServerName,
            10 => ExtensionType::SupportedGroups,
            13 => ExtensionType::SignatureAlgorithms,
            16 => ExtensionType::ApplicationLayerProtocolNegotiation,
            41 => ExtensionType::PreSharedKey,
            42 => ExtensionType::EarlyData,
            43 => ExtensionType::SupportedVersions,
            44 => ExtensionType::Cookie,
            45 => ExtensionType::PskKeyExchangeModes,
            51 => ExtensionType::KeyShare,
            _ => ExtensionType::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ExtensionType::ServerName => 0,
            ExtensionType::SupportedGroups => 10,
            ExtensionType::SignatureAlgorithms => 13,
            ExtensionType::ApplicationLayerProtocolNegotiation => 16,
            ExtensionType::PreSharedKey => 41,
            ExtensionType::EarlyData => 42,
            ExtensionType::SupportedVersions => 43,
            ExtensionType::Cookie => 44,
            ExtensionType::PskKeyExchangeModes => 45,
            ExtensionType::KeyShare => 51,
            ExtensionType::Unknown(v) => *v,
        }
    }
}

/// Walk an `extensions<0..2^16-1>` block, calling `f` for every entry.
///
/// An absent block (no bytes left) is an empty list. A repeated extension
/// type is an error. `f` returns the byte offset of the entry within `input`
/// alongside the type and body, which the pre_shared_key binders need.
pub(crate) fn parse_extensions<'a, F>(input: &'a [u8], mut f: F) -> IResult<&'a [u8], ()>
where
    F: FnMut(ExtensionType, &'a [u8], usize) -> Result<(), ErrorKind>,
{
    if input.is_empty() {
        return Ok((input, ()));
    }
    let (rest, block) = vec16(input)?;

    let mut seen: ArrayVec<u16, 32> = ArrayVec::new();
    let mut i = block;
    while !i.is_empty() {
        let (r, ty) = be_u16(i)?;
        let (r, body) = vec16(r)?;
        if seen.contains(&ty) {
            return Err(Err::Error(NomError::new(i, ErrorKind::Verify)));
        }
        if seen.try_push(ty).is_err() {
            return Err(Err::Error(NomError::new(i, ErrorKind::TooLarge)));
        }

        let offset = body.as_ptr() as usize - input.as_ptr() as usize;
        f(ExtensionType::from_u16(ty), body, offset)
            .map_err(|kind| Err::Error(NomError::new(body, kind)))?;
        i = r;
    }

    Ok((rest, ()))
}

/// Run `parser` over a whole extension body.
pub(crate) fn finish<'a, T>(
    body: &'a [u8],
    parser: impl FnOnce(&'a [u8]) -> IResult<&'a [u8], T>,
) -> Result<T, ErrorKind> {
    match parser(body) {
        Ok((rest, v)) if rest.is_empty() => Ok(v),
        Ok(_) => Err(ErrorKind::Eof),
        Err(Err::Error(e)) | Err(Err::Failure(e)) => Err(e.code),
        Err(Err::Incomplete(_)) => Err(ErrorKind::Complete),
    }
}

/// Big-endian u16 items of a list body.
pub(crate) fn u16_items(data: &[u8]) -> Result<impl Iterator<Item = u16> + '_, ErrorKind> {
    if data.len() % 2 != 0 {
        return Err(ErrorKind::LengthValue);
    }
    Ok(data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])))
}

/// Append one extension, with `f` writing the body.
pub(crate) fn write_extension(out: &mut Buf, ty: ExtensionType, f: impl FnOnce(&mut Buf)) {
    out.extend_from_slice(&ty.as_u16().to_be_bytes());
    with_len16(out, f);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_entries() {
        let mut out = Buf::new();
        with_len16(&mut out, |o| {
            write_extension(o, ExtensionType::Cookie, |o| o.extend_from_slice(b"ab"));
            write_extension(o, ExtensionType::Unknown(0x1234), |_| {});
        });

        let mut seen = Vec::new();
        let (rest, ()) = parse_extensions(&out, |ty, body, offset| {
            seen.push((ty, body.to_vec(), offset));
            Ok(())
        })
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(seen[0], (ExtensionType::Cookie, b"ab".to_vec(), 6));
        assert_eq!(seen[1].0, ExtensionType::Unknown(0x1234));
    }

    #[test]
    fn duplicate_rejected() {
        let mut out = Buf::new();
        with_len16(&mut out, |o| {
            write_extension(o, ExtensionType::Cookie, |_| {});
            write_extension(o, ExtensionType::Cookie, |_| {});
        });
        assert!(parse_extensions(&out, |_, _, _| Ok(())).is_err());
    }

    #[test]
    fn absent_block_is_empty() {
        assert!(parse_extensions(&[], |_, _, _| Ok(())).is_ok());
    }
}
