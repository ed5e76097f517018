//! EncryptedExtensions and the messages sent after the handshake.

use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u32, be_u8};
use nom::{Err, IResult};

use super::extensions::{finish, parse_extensions, write_extension, ExtensionType};
use super::{vec16, vec8, with_len16, write_vec16, write_vec8};
use crate::buffer::Buf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedExtensions<'a> {
    /// The protocol the server selected.
    pub alpn: Option<&'a [u8]>,
}

impl<'a> EncryptedExtensions<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], EncryptedExtensions<'a>> {
        if input.is_empty() {
            // The extensions block is mandatory here.
            return Err(Err::Error(NomError::new(input, ErrorKind::Eof)));
        }
        let mut ee = EncryptedExtensions::default();
        let (rest, ()) = parse_extensions(input, |ty, body, _| {
            match ty {
                ExtensionType::ApplicationLayerProtocolNegotiation => {
                    let list = finish(body, vec16)?;
                    // exactly one name
                    ee.alpn = Some(finish(list, vec8)?);
                }
                ExtensionType::KeyShare
                | ExtensionType::PreSharedKey
                | ExtensionType::SupportedVersions
                | ExtensionType::Cookie => return Err(ErrorKind::Verify),
                _ => {}
            }
            Ok(())
        })?;
        Ok((rest, ee))
    }

    pub fn write(&self, out: &mut Buf) {
        with_len16(out, |o| {
            if let Some(name) = self.alpn {
                write_extension(o, ExtensionType::ApplicationLayerProtocolNegotiation, |o| {
                    with_len16(o, |o| write_vec8(o, name));
                });
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    pub update_requested: bool,
}

impl KeyUpdate {
    pub fn parse(input: &[u8]) -> IResult<&[u8], KeyUpdate> {
        let (rest, v) = be_u8(input)?;
        let update_requested = match v {
            0 => false,
            1 => true,
            _ => return Err(Err::Error(NomError::new(input, ErrorKind::Verify))),
        };
        Ok((rest, KeyUpdate { update_requested }))
    }

    pub fn write(&self, out: &mut Buf) {
        out.push(self.update_requested as u8);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket<'a> {
    /// Seconds.
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: &'a [u8],
    pub ticket: &'a [u8],
}

impl<'a> NewSessionTicket<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], NewSessionTicket<'a>> {
        let (input, lifetime) = be_u32(input)?;
        let (input, age_add) = be_u32(input)?;
        let (input, nonce) = vec8(input)?;
        let (input, ticket) = vec16(input)?;
        let (input, _extensions) = vec16(input)?;
        if ticket.is_empty() {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }
        Ok((
            input,
            NewSessionTicket {
                lifetime,
                age_add,
                nonce,
                ticket,
            },
        ))
    }

    pub fn write(&self, out: &mut Buf) {
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        out.extend_from_slice(&self.age_add.to_be_bytes());
        write_vec8(out, self.nonce);
        write_vec16(out, self.ticket);
        write_vec16(out, &[]);
    }
}
