//! Record protection keys: AEAD plus the sequence number mask cipher.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::cipher::BlockEncrypt;
use aes_gcm::aes::{Aes128, Aes256, Block};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, Zeroizing};

use super::hkdf::expand_label;
use super::CipherSuite;
use crate::Error;

/// Authentication tag length for every supported AEAD.
pub const TAG_LEN: usize = 16;

const IV_LEN: usize = 12;

enum Aead {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

enum SnCipher {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
    ChaCha(Zeroizing<[u8; 32]>),
}

/// AEAD key, IV, and sequence number key for one direction of one epoch.
pub struct SymmetricKeys {
    suite: CipherSuite,
    aead: Aead,
    iv: Zeroizing<[u8; IV_LEN]>,
    sn: SnCipher,
}

impl SymmetricKeys {
    pub(super) fn derive(suite: CipherSuite, secret: &[u8]) -> Result<Self, Error> {
        let mut key = [0u8; 32];
        let mut sn_key = [0u8; 32];
        let mut iv = [0u8; IV_LEN];
        let klen = suite.key_len();
        let hash = suite.hash_algorithm();

        expand_label(hash, secret, b"key", &[], &mut key[..klen])?;
        expand_label(hash, secret, b"iv", &[], &mut iv)?;
        expand_label(hash, secret, b"sn", &[], &mut sn_key[..klen])?;

        let bad_key = |_| Error::CryptoError("Invalid key length".into());
        let (aead, sn) = match suite {
            CipherSuite::Aes128GcmSha256 => (
                Aead::Aes128(Box::new(
                    Aes128Gcm::new_from_slice(&key[..klen]).map_err(bad_key)?,
                )),
                SnCipher::Aes128(Box::new(
                    Aes128::new_from_slice(&sn_key[..klen]).map_err(bad_key)?,
                )),
            ),
            CipherSuite::Aes256GcmSha384 => (
                Aead::Aes256(Box::new(
                    Aes256Gcm::new_from_slice(&key[..klen]).map_err(bad_key)?,
                )),
                SnCipher::Aes256(Box::new(
                    Aes256::new_from_slice(&sn_key[..klen]).map_err(bad_key)?,
                )),
            ),
            CipherSuite::ChaCha20Poly1305Sha256 => (
                Aead::ChaCha(Box::new(
                    ChaCha20Poly1305::new_from_slice(&key[..klen]).map_err(bad_key)?,
                )),
                SnCipher::ChaCha(Zeroizing::new(sn_key)),
            ),
        };

        key.zeroize();
        sn_key.zeroize();

        let keys = Self {
            suite,
            aead,
            iv: Zeroizing::new(iv),
            sn,
        };
        iv.zeroize();
        Ok(keys)
    }

    /// Replace the keys in place, keeping the boxed cipher allocations when
    /// the suite is unchanged.
    pub(super) fn rekey(&mut self, suite: CipherSuite, secret: &[u8]) -> Result<(), Error> {
        let fresh = Self::derive(suite, secret)?;
        self.iv = fresh.iv;
        self.suite = suite;
        match (&mut self.aead, fresh.aead) {
            (Aead::Aes128(old), Aead::Aes128(new)) => **old = *new,
            (Aead::Aes256(old), Aead::Aes256(new)) => **old = *new,
            (Aead::ChaCha(old), Aead::ChaCha(new)) => **old = *new,
            (slot, new) => *slot = new,
        }
        match (&mut self.sn, fresh.sn) {
            (SnCipher::Aes128(old), SnCipher::Aes128(new)) => **old = *new,
            (SnCipher::Aes256(old), SnCipher::Aes256(new)) => **old = *new,
            (slot, new) => *slot = new,
        }
        Ok(())
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// nonce = iv XOR pad_left(seq, 12) (RFC 8446 §5.3).
    fn nonce(&self, seq: u64) -> [u8; IV_LEN] {
        let mut nonce = *self.iv;
        for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }

    /// Encrypt `data` in place. Returns the tag to append.
    pub fn seal(&self, seq: u64, aad: &[u8], data: &mut [u8]) -> Result<[u8; TAG_LEN], Error> {
        let nonce = self.nonce(seq);
        let nonce = GenericArray::from_slice(&nonce);
        let failed = |_| Error::CryptoError("AEAD seal failed".into());
        let tag = match &self.aead {
            Aead::Aes128(c) => c.encrypt_in_place_detached(nonce, aad, data),
            Aead::Aes256(c) => c.encrypt_in_place_detached(nonce, aad, data),
            Aead::ChaCha(c) => c.encrypt_in_place_detached(nonce, aad, data),
        }
        .map_err(failed)?;
        Ok(tag.into())
    }

    /// Decrypt `data` in place and check `tag`.
    pub fn open(&self, seq: u64, aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<(), Error> {
        if tag.len() != TAG_LEN {
            return Err(Error::BadRecordMac);
        }
        let nonce = self.nonce(seq);
        let nonce = GenericArray::from_slice(&nonce);
        let tag = GenericArray::from_slice(tag);
        match &self.aead {
            Aead::Aes128(c) => c.decrypt_in_place_detached(nonce, aad, data, tag),
            Aead::Aes256(c) => c.decrypt_in_place_detached(nonce, aad, data, tag),
            Aead::ChaCha(c) => c.decrypt_in_place_detached(nonce, aad, data, tag),
        }
        .map_err(|_| Error::BadRecordMac)
    }

    /// Mask for the on-wire sequence number bytes (RFC 9147 §4.2.3).
    ///
    /// `sample` is the first 16 bytes of the record ciphertext.
    pub fn sn_mask(&self, sample: &[u8; 16]) -> [u8; 16] {
        match &self.sn {
            SnCipher::Aes128(c) => {
                let mut block = Block::clone_from_slice(sample);
                c.encrypt_block(&mut block);
                block.into()
            }
            SnCipher::Aes256(c) => {
                let mut block = Block::clone_from_slice(sample);
                c.encrypt_block(&mut block);
                block.into()
            }
            SnCipher::ChaCha(key) => {
                let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let mut cipher = ChaCha20::new(
                    chacha20::Key::from_slice(&key[..]),
                    chacha20::Nonce::from_slice(&sample[4..]),
                );
                cipher.seek(counter as u64 * 64);
                let mut mask = [0u8; 16];
                cipher.apply_keystream(&mut mask);
                mask
            }
        }
    }
}

impl fmt::Debug for SymmetricKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeys")
            .field("suite", &self.suite)
            .finish()
    }
}
