//! Stateless retry cookies (RFC 9147 §5.1).
//!
//! ```text
//! salt(16) || created_ms(8) || key_share_requested(1) || hash_len(1) || hash
//!          || HMAC-SHA256(key, all of the above || peer ip || peer port)
//! ```
//!
//! The hash commits to ClientHello1 so the server can rebuild the transcript
//! from the second ClientHello alone. Nothing is stored between the two.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::{Digest, MAX_HASH_LEN};
use crate::rng::fill_secure;
use crate::time_tricks::InstantExt;

const SALT_LEN: usize = 16;
const TAG_LEN: usize = 32;
const FIXED_LEN: usize = SALT_LEN + 8 + 1 + 1;

/// Upper bound on the size of a cookie.
pub const MAX_COOKIE_LEN: usize = 128;

pub type Cookie = ArrayVec<u8, MAX_COOKIE_LEN>;

/// What a valid cookie vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidCookie {
    pub age: Duration,
    /// Transcript hash of ClientHello1.
    pub transcript_hash: Digest,
    /// Whether the HelloRetryRequest asked for a different key share.
    pub key_share_requested: bool,
}

/// Server-wide cookie key. Read-only after creation.
pub struct CookieState {
    key: Zeroizing<[u8; 32]>,
    lifetime: Duration,
}

impl CookieState {
    /// New state with a random key.
    pub fn new(lifetime: Duration) -> Self {
        let mut key = [0u8; 32];
        fill_secure(&mut key);
        Self::with_key(key, lifetime)
    }

    pub fn with_key(key: [u8; 32], lifetime: Duration) -> Self {
        CookieState {
            key: Zeroizing::new(key),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mint a cookie for `peer`.
    ///
    /// Panics if `transcript_hash` is longer than the largest hash output.
    pub fn create(
        &self,
        transcript_hash: &[u8],
        key_share_requested: bool,
        peer: SocketAddr,
        now: Instant,
    ) -> Cookie {
        assert!(transcript_hash.len() <= MAX_HASH_LEN);

        let mut salt = [0u8; SALT_LEN];
        fill_secure(&mut salt);

        let mut cookie = Cookie::new();
        cookie.extend(salt);
        cookie.extend(now.to_unix_millis().to_be_bytes());
        cookie.push(key_share_requested as u8);
        cookie.push(transcript_hash.len() as u8);
        cookie.extend(transcript_hash.iter().copied());

        let tag = self.tag(&cookie, peer);
        cookie.extend(tag);
        cookie
    }

    /// Check a cookie presented by `peer`.
    ///
    /// `None` if it was tampered with, minted for another address, is older
    /// than the lifetime or claims to be from the future.
    pub fn validate(&self, cookie: &[u8], peer: SocketAddr, now: Instant) -> Option<ValidCookie> {
        if cookie.len() < FIXED_LEN + TAG_LEN {
            return None;
        }
        let hash_len = cookie[FIXED_LEN - 1] as usize;
        if hash_len > MAX_HASH_LEN || cookie.len() != FIXED_LEN + hash_len + TAG_LEN {
            return None;
        }

        let (fields, tag) = cookie.split_at(FIXED_LEN + hash_len);
        let expected = self.tag(fields, peer);
        if !bool::from(expected.ct_eq(tag)) {
            return None;
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&fields[SALT_LEN..SALT_LEN + 8]);
        let created = u64::from_be_bytes(ts);
        let now_ms = now.to_unix_millis();
        if created > now_ms {
            return None;
        }
        let age = Duration::from_millis(now_ms - created);
        if age > self.lifetime {
            return None;
        }

        let key_share_requested = match fields[SALT_LEN + 8] {
            0 => false,
            1 => true,
            _ => return None,
        };

        Some(ValidCookie {
            age,
            transcript_hash: fields[FIXED_LEN..].iter().copied().collect(),
            key_share_requested,
        })
    }

    fn tag(&self, fields: &[u8], peer: SocketAddr) -> [u8; TAG_LEN] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key[..]).expect("HMAC accepts any key length");
        mac.update(fields);
        match peer.ip() {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        mac.update(&peer.port().to_be_bytes());
        mac.finalize().into_bytes().into()
    }
}

impl std::fmt::Debug for CookieState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieState")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}
