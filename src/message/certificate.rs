use arrayvec::ArrayVec;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::be_u16;
use nom::{Err, IResult};

use super::{vec16, vec24, vec8, with_len24, write_vec16};
use crate::buffer::Buf;

/// Longest certificate chain accepted from a peer.
pub const MAX_CHAIN_LEN: usize = 4;

/// TLS 1.3 Certificate (RFC 8446 §4.4.2). Entry extensions are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate<'a> {
    pub context: &'a [u8],
    /// DER certificates, end-entity first.
    pub chain: ArrayVec<&'a [u8], MAX_CHAIN_LEN>,
}

impl<'a> Certificate<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Certificate<'a>> {
        let (input, context) = vec8(input)?;
        let (rest, mut list) = vec24(input)?;

        let mut chain = ArrayVec::new();
        while !list.is_empty() {
            let (r, cert) = vec24(list)?;
            let (r, _extensions) = vec16(r)?;
            if cert.is_empty() {
                return Err(Err::Error(NomError::new(list, ErrorKind::Verify)));
            }
            if chain.try_push(cert).is_err() {
                return Err(Err::Error(NomError::new(list, ErrorKind::TooLarge)));
            }
            list = r;
        }

        Ok((rest, Certificate { context, chain }))
    }

    pub fn write(&self, out: &mut Buf) {
        super::write_vec8(out, self.context);
        with_len24(out, |o| {
            for cert in &self.chain {
                with_len24(o, |o| o.extend_from_slice(cert));
                write_vec16(o, &[]);
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify<'a> {
    pub scheme: u16,
    pub signature: &'a [u8],
}

impl<'a> CertificateVerify<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], CertificateVerify<'a>> {
        let (input, scheme) = be_u16(input)?;
        let (input, signature) = vec16(input)?;
        Ok((input, CertificateVerify { scheme, signature }))
    }

    pub fn write(&self, out: &mut Buf) {
        out.extend_from_slice(&self.scheme.to_be_bytes());
        write_vec16(out, self.signature);
    }

    /// The content a CertificateVerify signature covers (RFC 8446 §4.4.3).
    pub fn signed_content(server: bool, transcript_hash: &[u8], out: &mut Buf) {
        out.extend_from_slice(&[0x20; 64]);
        if server {
            out.extend_from_slice(b"TLS 1.3, server CertificateVerify");
        } else {
            out.extend_from_slice(b"TLS 1.3, client CertificateVerify");
        }
        out.push(0);
        out.extend_from_slice(transcript_hash);
    }
}
