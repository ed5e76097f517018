use arrayvec::ArrayVec;
use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u32};
use nom::{Err, IResult};

use super::extensions::{finish, parse_extensions, u16_items, write_extension, ExtensionType};
use super::{vec16, vec8, with_len16, with_len8, write_vec16, write_vec8, DTLS1_2, DTLS1_3};
use crate::buffer::Buf;
use crate::crypto::{CipherSuite, NamedGroup};

/// The one external PSK offered in a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedPsk<'a> {
    pub identity: &'a [u8],
    pub obfuscated_ticket_age: u32,
    pub binder: &'a [u8],
    /// Offset of the binders list within the ClientHello body. The binder
    /// MAC covers the body up to here.
    pub binders_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub random: [u8; 32],
    pub session_id: &'a [u8],
    /// Offered suites we know, in client preference order.
    pub cipher_suites: ArrayVec<CipherSuite, 3>,
    pub supports_dtls13: bool,
    /// Offered groups we support, in client preference order.
    pub groups: ArrayVec<NamedGroup, 2>,
    pub signature_schemes: ArrayVec<u16, 16>,
    /// Key shares for groups we support.
    pub key_shares: ArrayVec<(NamedGroup, &'a [u8]), 2>,
    pub cookie: Option<&'a [u8]>,
    pub alpn: ArrayVec<&'a [u8], 16>,
    pub psk_dhe_ke: bool,
    pub psk: Option<OfferedPsk<'a>>,
}

impl<'a> ClientHello<'a> {
    pub fn new(random: [u8; 32]) -> Self {
        ClientHello {
            random,
            session_id: &[],
            cipher_suites: ArrayVec::new(),
            supports_dtls13: true,
            groups: ArrayVec::new(),
            signature_schemes: ArrayVec::new(),
            key_shares: ArrayVec::new(),
            cookie: None,
            alpn: ArrayVec::new(),
            psk_dhe_ke: false,
            psk: None,
        }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientHello<'a>> {
        let original = input;
        let (input, _legacy_version) = be_u16(input)?;
        let (input, random) = take(32usize)(input)?;
        let (input, session_id) = vec8(input)?;
        if session_id.len() > 32 {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }
        // legacy_cookie, always empty in DTLS 1.3
        let (input, legacy_cookie) = vec8(input)?;
        if !legacy_cookie.is_empty() {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }
        let (input, suites) = vec16(input)?;
        let (input, compression) = vec8(input)?;
        if compression != [0] {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }

        let mut r = [0u8; 32];
        r.copy_from_slice(random);
        let mut hello = ClientHello::new(r);
        hello.session_id = session_id;
        hello.supports_dtls13 = false;

        let items = u16_items(suites).map_err(|k| Err::Error(NomError::new(suites, k)))?;
        for suite in items.filter_map(CipherSuite::from_u16) {
            if !hello.cipher_suites.contains(&suite) {
                hello.cipher_suites.push(suite);
            }
        }

        let ext_base = original.len() - input.len();
        let mut psk_seen = false;

        let (rest, ()) = parse_extensions(input, |ty, body, offset| {
            if psk_seen {
                // pre_shared_key must be the last extension
                return Err(ErrorKind::Verify);
            }
            match ty {
                ExtensionType::SupportedVersions => {
                    let list = finish(body, vec8)?;
                    hello.supports_dtls13 = u16_items(list)?.any(|v| v == DTLS1_3);
                }
                ExtensionType::SupportedGroups => {
                    let list = finish(body, vec16)?;
                    for group in u16_items(list)?.map(NamedGroup::from_u16) {
                        if group.is_supported() && !hello.groups.contains(&group) {
                            hello.groups.push(group);
                        }
                    }
                }
                ExtensionType::SignatureAlgorithms => {
                    let list = finish(body, vec16)?;
                    for scheme in u16_items(list)?.take(16) {
                        hello.signature_schemes.push(scheme);
                    }
                }
                ExtensionType::KeyShare => {
                    let mut list = finish(body, vec16)?;
                    while !list.is_empty() {
                        let (r, group) = be_u16::<_, NomError<&[u8]>>(list).map_err(|_| ErrorKind::Eof)?;
                        let (r, key) = vec16(r).map_err(|_| ErrorKind::Eof)?;
                        let group = NamedGroup::from_u16(group);
                        if group.is_supported() {
                            if hello.key_shares.iter().any(|(g, _)| *g == group) {
                                return Err(ErrorKind::Verify);
                            }
                            hello.key_shares.push((group, key));
                        }
                        list = r;
                    }
                }
                ExtensionType::Cookie => {
                    let cookie = finish(body, vec16)?;
                    if cookie.is_empty() {
                        return Err(ErrorKind::Verify);
                    }
                    hello.cookie = Some(cookie);
                }
                ExtensionType::ApplicationLayerProtocolNegotiation => {
                    let mut list = finish(body, vec16)?;
                    while !list.is_empty() {
                        let (r, name) = vec8(list).map_err(|_| ErrorKind::Eof)?;
                        if name.is_empty() || hello.alpn.try_push(name).is_err() {
                            return Err(ErrorKind::Verify);
                        }
                        list = r;
                    }
                }
                ExtensionType::PskKeyExchangeModes => {
                    let modes = finish(body, vec8)?;
                    // psk_dhe_ke
                    hello.psk_dhe_ke = modes.contains(&1);
                }
                ExtensionType::PreSharedKey => {
                    psk_seen = true;
                    let (r, identities) = vec16(body).map_err(|_| ErrorKind::Eof)?;
                    let binders_offset = ext_base + offset + (body.len() - r.len());
                    let binders = finish(r, vec16)?;

                    let (ids_rest, identity) = vec16(identities).map_err(|_| ErrorKind::Eof)?;
                    let (_, age) = be_u32::<_, NomError<&[u8]>>(ids_rest).map_err(|_| ErrorKind::Eof)?;
                    let (_, binder) = vec8(binders).map_err(|_| ErrorKind::Eof)?;
                    if identity.is_empty() || binder.len() < 32 {
                        return Err(ErrorKind::Verify);
                    }

                    hello.psk = Some(OfferedPsk {
                        identity,
                        obfuscated_ticket_age: age,
                        binder,
                        binders_offset,
                    });
                }
                _ => {}
            }
            Ok(())
        })?;

        Ok((rest, hello))
    }

    /// Append the ClientHello body.
    ///
    /// Returns the position of the binders list in `out` when a PSK is
    /// offered, so the caller can fill in the binder.
    pub fn write(&self, out: &mut Buf) -> Option<usize> {
        out.extend_from_slice(&DTLS1_2.to_be_bytes());
        out.extend_from_slice(&self.random);
        write_vec8(out, self.session_id);
        // legacy_cookie
        out.push(0);
        with_len16(out, |o| {
            for suite in &self.cipher_suites {
                o.extend_from_slice(&suite.as_u16().to_be_bytes());
            }
        });
        // legacy_compression_methods: null
        out.extend_from_slice(&[1, 0]);

        let mut binders_at = None;

        with_len16(out, |o| {
            write_extension(o, ExtensionType::SupportedVersions, |o| {
                with_len8(o, |o| o.extend_from_slice(&DTLS1_3.to_be_bytes()));
            });
            write_extension(o, ExtensionType::SupportedGroups, |o| {
                with_len16(o, |o| {
                    for g in &self.groups {
                        o.extend_from_slice(&g.as_u16().to_be_bytes());
                    }
                });
            });
            write_extension(o, ExtensionType::SignatureAlgorithms, |o| {
                with_len16(o, |o| {
                    for s in &self.signature_schemes {
                        o.extend_from_slice(&s.to_be_bytes());
                    }
                });
            });
            write_extension(o, ExtensionType::KeyShare, |o| {
                with_len16(o, |o| {
                    for (group, key) in &self.key_shares {
                        o.extend_from_slice(&group.as_u16().to_be_bytes());
                        write_vec16(o, key);
                    }
                });
            });
            if let Some(cookie) = self.cookie {
                write_extension(o, ExtensionType::Cookie, |o| write_vec16(o, cookie));
            }
            if !self.alpn.is_empty() {
                write_extension(o, ExtensionType::ApplicationLayerProtocolNegotiation, |o| {
                    with_len16(o, |o| {
                        for name in &self.alpn {
                            write_vec8(o, name);
                        }
                    });
                });
            }
            if self.psk_dhe_ke {
                write_extension(o, ExtensionType::PskKeyExchangeModes, |o| {
                    o.extend_from_slice(&[1, 1]);
                });
            }
            if let Some(psk) = &self.psk {
                write_extension(o, ExtensionType::PreSharedKey, |o| {
                    with_len16(o, |o| {
                        write_vec16(o, psk.identity);
                        o.extend_from_slice(&psk.obfuscated_ticket_age.to_be_bytes());
                    });
                    binders_at = Some(o.len());
                    with_len16(o, |o| write_vec8(o, psk.binder));
                });
            }
        });

        binders_at
    }
}
