//! Stateless handling of the first ClientHello (RFC 9147 §5.1).
//!
//! A server never allocates a connection for a ClientHello without a valid
//! cookie. It answers with a HelloRetryRequest whose cookie commits to the
//! ClientHello and the sender's address, and only the second ClientHello,
//! carrying that cookie back, becomes an [`Accepted`] connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buf;
use crate::cookie::{CookieState, ValidCookie};
use crate::crypto::{CipherSuite, NamedGroup};
use crate::message::{
    decode, ClientHello, FragmentHeader, MessageType, ServerHello, DTLS1_3, HRR_RANDOM,
};
use crate::record::{self, ContentType, HeaderKind, RecordHeader};
use crate::Config;

/// What to do with a datagram from an unknown address.
#[derive(Debug)]
pub enum Accept {
    /// A HelloRetryRequest was written to `out`. Send it back.
    Retry,
    /// The ClientHello carried a valid cookie.
    Accepted(Box<Accepted>),
    /// Not a ClientHello we answer.
    Drop,
}

/// A second ClientHello with a valid cookie, ready for
/// [`Connection::accept`](crate::Connection::accept).
#[derive(Debug)]
pub struct Accepted {
    pub(crate) peer: SocketAddr,
    pub(crate) client_hello: Buf,
    pub(crate) record_seq: u64,
    pub(crate) message_seq: u16,
    pub(crate) cookie: ValidCookie,
    pub(crate) suite: CipherSuite,
    pub(crate) group: NamedGroup,
}

impl Accepted {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.suite
    }
}

/// Server-wide, read-only after creation. Safe to share between threads.
pub struct Acceptor {
    config: Arc<Config>,
    cookies: CookieState,
}

impl Acceptor {
    pub fn new(config: Arc<Config>) -> Self {
        let cookies = CookieState::new(config.cookie_lifetime());
        Acceptor { config, cookies }
    }

    /// With a fixed cookie key, so that several acceptors agree.
    pub fn with_cookie_key(config: Arc<Config>, key: [u8; 32]) -> Self {
        let cookies = CookieState::with_key(key, config.cookie_lifetime());
        Acceptor { config, cookies }
    }

    /// Look at a datagram from an address without a connection.
    pub fn process(&self, datagram: &[u8], peer: SocketAddr, now: Instant, out: &mut Buf) -> Accept {
        out.clear();

        let Ok((_, header)) = RecordHeader::parse(datagram, 0) else {
            trace!("Acceptor: unparseable datagram from {}", peer);
            return Accept::Drop;
        };
        let HeaderKind::Plaintext {
            content_type: ContentType::Handshake,
            epoch: 0,
            seq,
        } = header.kind
        else {
            trace!("Acceptor: not a plaintext handshake record from {}", peer);
            return Accept::Drop;
        };

        let Ok((rest, (fragment, body))) = FragmentHeader::parse(&datagram[header.body]) else {
            return Accept::Drop;
        };
        // Only a ClientHello in one piece is answered statelessly.
        if fragment.msg_type != MessageType::ClientHello || !fragment.is_complete() || !rest.is_empty() {
            trace!("Acceptor: fragmented or not a ClientHello from {}", peer);
            return Accept::Drop;
        }

        let Ok(hello) = decode(body, ClientHello::parse, "ClientHello") else {
            debug!("Acceptor: malformed ClientHello from {}", peer);
            return Accept::Drop;
        };
        if !hello.supports_dtls13 {
            debug!("Acceptor: {} does not offer DTLS 1.3", peer);
            return Accept::Drop;
        }

        let Some(suite) = self
            .config
            .cipher_suites()
            .iter()
            .copied()
            .find(|s| hello.cipher_suites.contains(s))
        else {
            debug!("Acceptor: no common cipher suite with {}", peer);
            return Accept::Drop;
        };
        let Some((group, has_share)) = select_group(&hello) else {
            debug!("Acceptor: no common group with {}", peer);
            return Accept::Drop;
        };

        let Some(cookie) = hello.cookie else {
            let hash = {
                let mut h = suite.new_hasher();
                h.update(&FragmentHeader::transcript_header(
                    MessageType::ClientHello,
                    body.len(),
                ));
                h.update(body);
                h.finalize()
            };
            let cookie = self.cookies.create(&hash, !has_share, peer, now);
            write_retry_record(
                out,
                seq,
                hello.session_id,
                suite,
                (!has_share).then_some(group),
                &cookie,
            );
            debug!("HelloRetryRequest to {} ({}, {:?})", peer, suite, group);
            return Accept::Retry;
        };

        let Some(valid) = self.cookies.validate(cookie, peer, now) else {
            warn!("Invalid cookie from {}", peer);
            return Accept::Drop;
        };
        if valid.transcript_hash.len() != suite.hash_algorithm().output_len() {
            warn!("Cookie from {} was minted for another suite", peer);
            return Accept::Drop;
        }

        trace!("Cookie from {} valid, age {:?}", peer, valid.age);
        Accept::Accepted(Box::new(Accepted {
            peer,
            client_hello: Buf::from_slice(body),
            record_seq: seq,
            message_seq: fragment.message_seq,
            cookie: valid,
            suite,
            group,
        }))
    }
}

/// First group in our preference the client sent a share for, else the
/// first one it supports at all. The bool says whether a share is there.
///
/// Deterministic, so that ClientHello1 and ClientHello2 pick the same.
fn select_group(hello: &ClientHello<'_>) -> Option<(NamedGroup, bool)> {
    let shared = NamedGroup::SUPPORTED
        .iter()
        .find(|g| hello.key_shares.iter().any(|(s, _)| s == *g));
    if let Some(group) = shared {
        return Some((*group, true));
    }
    NamedGroup::SUPPORTED
        .iter()
        .find(|g| hello.groups.contains(g))
        .map(|g| (*g, false))
}

/// HelloRetryRequest body. The server rebuilds the identical message for
/// its transcript when the second ClientHello arrives.
pub(crate) fn write_hello_retry(
    out: &mut Buf,
    session_id: &[u8],
    suite: CipherSuite,
    group: Option<NamedGroup>,
    cookie: &[u8],
) {
    let mut hello = ServerHello::new(HRR_RANDOM, session_id, suite.as_u16());
    hello.selected_version = Some(DTLS1_3);
    hello.selected_group = group;
    hello.cookie = Some(cookie);
    hello.write(out);
}

/// The whole HelloRetryRequest datagram, message_seq 0, with the record
/// number of the ClientHello it answers.
fn write_retry_record(
    out: &mut Buf,
    record_seq: u64,
    session_id: &[u8],
    suite: CipherSuite,
    group: Option<NamedGroup>,
    cookie: &[u8],
) {
    let mut body = Buf::new();
    write_hello_retry(&mut body, session_id, suite, group, cookie);

    let mut fragment = Buf::with_capacity(body.len() + 12);
    FragmentHeader {
        msg_type: MessageType::ServerHello,
        length: body.len() as u32,
        message_seq: 0,
        fragment_offset: 0,
        fragment_length: body.len() as u32,
    }
    .write(&mut fragment);
    fragment.extend_from_slice(&body);

    record::write_plaintext(out, ContentType::Handshake, record_seq, &fragment);
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor").field("cookies", &self.cookies).finish()
    }
}
