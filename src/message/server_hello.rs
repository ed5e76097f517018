use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use super::extensions::{finish, parse_extensions, write_extension, ExtensionType};
use super::{vec16, vec8, with_len16, write_vec16, write_vec8, DTLS1_2};
use crate::buffer::Buf;
use crate::crypto::NamedGroup;

/// SHA-256("HelloRetryRequest"), the random of every HelloRetryRequest.
pub const HRR_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// ServerHello, or a HelloRetryRequest when `random` is [`HRR_RANDOM`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello<'a> {
    pub random: [u8; 32],
    pub session_id_echo: &'a [u8],
    /// Raw id so the client can tell an unknown suite from a missing one.
    pub cipher_suite: u16,
    pub selected_version: Option<u16>,
    /// ServerHello only.
    pub key_share: Option<(NamedGroup, &'a [u8])>,
    /// HelloRetryRequest only.
    pub selected_group: Option<NamedGroup>,
    /// HelloRetryRequest only.
    pub cookie: Option<&'a [u8]>,
    pub selected_psk: Option<u16>,
}

impl<'a> ServerHello<'a> {
    pub fn new(random: [u8; 32], session_id_echo: &'a [u8], cipher_suite: u16) -> Self {
        ServerHello {
            random,
            session_id_echo,
            cipher_suite,
            selected_version: None,
            key_share: None,
            selected_group: None,
            cookie: None,
            selected_psk: None,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.random == HRR_RANDOM
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ServerHello<'a>> {
        let (input, _legacy_version) = be_u16(input)?;
        let (input, random) = take(32usize)(input)?;
        let (input, session_id_echo) = vec8(input)?;
        let (input, cipher_suite) = be_u16(input)?;
        let (input, compression) = be_u8(input)?;
        if compression != 0 {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }

        let mut r = [0u8; 32];
        r.copy_from_slice(random);
        let mut hello = ServerHello::new(r, session_id_echo, cipher_suite);
        let retry = hello.is_retry();

        let (rest, ()) = parse_extensions(input, |ty, body, _| {
            match ty {
                ExtensionType::SupportedVersions => {
                    hello.selected_version = Some(finish(body, be_u16)?);
                }
                ExtensionType::KeyShare if retry => {
                    hello.selected_group = Some(NamedGroup::from_u16(finish(body, be_u16)?));
                }
                ExtensionType::KeyShare => {
                    let (group, key) = finish(body, |i| {
                        let (i, group) = be_u16(i)?;
                        let (i, key) = vec16(i)?;
                        Ok((i, (group, key)))
                    })?;
                    hello.key_share = Some((NamedGroup::from_u16(group), key));
                }
                ExtensionType::Cookie if retry => {
                    hello.cookie = Some(finish(body, vec16)?);
                }
                ExtensionType::PreSharedKey if !retry => {
                    hello.selected_psk = Some(finish(body, be_u16)?);
                }
                // Anything else is not allowed in a (retry) ServerHello.
                _ => return Err(ErrorKind::Verify),
            }
            Ok(())
        })?;

        Ok((rest, hello))
    }

    pub fn write(&self, out: &mut Buf) {
        out.extend_from_slice(&DTLS1_2.to_be_bytes());
        out.extend_from_slice(&self.random);
        write_vec8(out, self.session_id_echo);
        out.extend_from_slice(&self.cipher_suite.to_be_bytes());
        out.push(0);

        with_len16(out, |o| {
            if let Some(v) = self.selected_version {
                write_extension(o, ExtensionType::SupportedVersions, |o| {
                    o.extend_from_slice(&v.to_be_bytes())
                });
            }
            if let Some((group, key)) = self.key_share {
                write_extension(o, ExtensionType::KeyShare, |o| {
                    o.extend_from_slice(&group.as_u16().to_be_bytes());
                    write_vec16(o, key);
                });
            }
            if let Some(group) = self.selected_group {
                write_extension(o, ExtensionType::KeyShare, |o| {
                    o.extend_from_slice(&group.as_u16().to_be_bytes())
                });
            }
            if let Some(cookie) = self.cookie {
                write_extension(o, ExtensionType::Cookie, |o| write_vec16(o, cookie));
            }
            if let Some(index) = self.selected_psk {
                write_extension(o, ExtensionType::PreSharedKey, |o| {
                    o.extend_from_slice(&index.to_be_bytes())
                });
            }
        });
    }
}
