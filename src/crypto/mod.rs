//! Cryptographic capability consumed by the engine.
//!
//! The engine only ever talks to a [`CipherSuite`]: it asks it for a
//! transcript hasher, an HMAC, and per-direction record keys derived from a
//! traffic secret. The primitives come from the RustCrypto crates.

use std::fmt;
use std::ops::Deref;

use arrayvec::ArrayVec;
use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256, Sha384};
use zeroize::Zeroize;

use crate::Error;

mod aead;
mod hkdf;
mod key_schedule;
mod kx;
mod sign;

pub use aead::{SymmetricKeys, TAG_LEN};
pub(crate) use hkdf::{expand_label, extract};
pub(crate) use key_schedule::{finished_mac, next_traffic_secret, KeySchedule};
pub use kx::{KeyExchange, NamedGroup};
pub use sign::{verify_signature, SigningKey, ECDSA_SECP256R1_SHA256};

/// Largest hash output among the supported suites (SHA-384).
pub const MAX_HASH_LEN: usize = 48;

/// A hash output.
pub type Digest = ArrayVec<u8, MAX_HASH_LEN>;

/// The cipher suites this engine negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256 (0x1301)
    Aes128GcmSha256,
    /// TLS_AES_256_GCM_SHA384 (0x1302)
    Aes256GcmSha384,
    /// TLS_CHACHA20_POLY1305_SHA256 (0x1303)
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 3] = [
        CipherSuite::Aes128GcmSha256,
        CipherSuite::Aes256GcmSha384,
        CipherSuite::ChaCha20Poly1305Sha256,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            0x1303 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    /// Like [`CipherSuite::from_u16`] but an unknown id is an error.
    pub fn try_from_u16(value: u16) -> Result<Self, Error> {
        Self::from_u16(value).ok_or(Error::UnknownCipherSuite(value))
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
            CipherSuite::ChaCha20Poly1305Sha256 => 0x1303,
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            CipherSuite::Aes256GcmSha384 => HashAlgorithm::Sha384,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// AEAD key length, also the sequence number key length.
    pub fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            _ => 32,
        }
    }

    /// Max number of AEAD operations per key before the margins erode.
    ///
    /// AES-GCM: 2^24.5 full-size records (RFC 9147 §4.5.3).
    /// ChaCha20-Poly1305: bounded by the 2^36 integrity limit.
    pub fn protection_limit(&self) -> u64 {
        match self {
            CipherSuite::ChaCha20Poly1305Sha256 => 1 << 36,
            _ => 23_726_566,
        }
    }

    pub fn new_hasher(&self) -> Hasher {
        Hasher::new(self.hash_algorithm())
    }

    pub fn new_hmac(&self, key: &[u8]) -> Result<HmacContext, Error> {
        HmacContext::new(self.hash_algorithm(), key)
    }

    /// Derive record keys from `secret`, reusing `old` allocations if given.
    pub fn reset_symmetric_keys(
        &self,
        old: Option<SymmetricKeys>,
        secret: &[u8],
    ) -> Result<SymmetricKeys, Error> {
        match old {
            Some(mut keys) => {
                keys.rekey(*self, secret)?;
                Ok(keys)
            }
            None => SymmetricKeys::derive(*self, secret),
        }
    }

    /// Hash of the empty string.
    pub fn empty_hash(&self) -> Digest {
        self.new_hasher().finalize()
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherSuite::Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::ChaCha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }
}

/// Running hash, cloneable so intermediate transcript hashes are cheap.
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Hasher::Sha256(_) => HashAlgorithm::Sha256,
            Hasher::Sha384(_) => HashAlgorithm::Sha384,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
        }
    }

    /// Hash of everything so far. The hasher can keep going.
    pub fn current(&self) -> Digest {
        self.clone().finalize()
    }

    pub fn finalize(self) -> Digest {
        let mut out = Digest::new();
        match self {
            Hasher::Sha256(h) => out.extend(h.finalize()),
            Hasher::Sha384(h) => out.extend(h.finalize()),
        }
        out
    }

    /// One-shot hash of `data`.
    pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Digest {
        let mut h = Hasher::new(algorithm);
        h.update(data);
        h.finalize()
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

pub enum HmacContext {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
}

impl HmacContext {
    pub fn new(algorithm: HashAlgorithm, key: &[u8]) -> Result<Self, Error> {
        let invalid = |_| Error::CryptoError("Invalid HMAC key length".into());
        Ok(match algorithm {
            HashAlgorithm::Sha256 => {
                HmacContext::Sha256(Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?)
            }
            HashAlgorithm::Sha384 => {
                HmacContext::Sha384(Hmac::<Sha384>::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            HmacContext::Sha256(m) => m.update(data),
            HmacContext::Sha384(m) => m.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        let mut out = Digest::new();
        match self {
            HmacContext::Sha256(m) => out.extend(m.finalize().into_bytes()),
            HmacContext::Sha384(m) => out.extend(m.finalize().into_bytes()),
        }
        out
    }
}

/// Secret bytes, wiped on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(ArrayVec<u8, MAX_HASH_LEN>);

impl Secret {
    /// Panics if `bytes` is longer than [`MAX_HASH_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut v = ArrayVec::new();
        v.try_extend_from_slice(bytes)
            .expect("secret longer than MAX_HASH_LEN");
        Secret(v)
    }

    pub fn zeros(len: usize) -> Self {
        let mut v = ArrayVec::new();
        v.extend(std::iter::repeat(0).take(len));
        Secret(v)
    }
}

impl Deref for Secret {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.as_mut_slice().zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_ids_roundtrip() {
        for suite in CipherSuite::ALL {
            assert_eq!(CipherSuite::from_u16(suite.as_u16()), Some(suite));
        }
        assert!(matches!(
            CipherSuite::try_from_u16(0x1304),
            Err(Error::UnknownCipherSuite(0x1304))
        ));
    }

    #[test]
    fn empty_hash_matches_known_value() {
        let h = CipherSuite::Aes128GcmSha256.empty_hash();
        assert_eq!(
            &h[..4],
            &[0xe3, 0xb0, 0xc4, 0x42],
            "sha256 of empty string"
        );
        assert_eq!(CipherSuite::Aes256GcmSha384.empty_hash().len(), 48);
    }

    #[test]
    fn hasher_current_does_not_consume() {
        let mut h = Hasher::new(HashAlgorithm::Sha256);
        h.update(b"abc");
        let a = h.current();
        let b = h.current();
        assert_eq!(a, b);
        h.update(b"def");
        assert_ne!(h.current(), a);
        assert_eq!(h.finalize(), Hasher::digest(HashAlgorithm::Sha256, b"abcdef"));
    }

    #[test]
    fn hmac_is_keyed() {
        let suite = CipherSuite::ChaCha20Poly1305Sha256;
        let mut a = suite.new_hmac(b"key one").unwrap();
        let mut b = suite.new_hmac(b"key two").unwrap();
        a.update(b"data");
        b.update(b"data");
        assert_ne!(a.finalize(), b.finalize());
    }
}
