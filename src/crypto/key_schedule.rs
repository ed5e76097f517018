//! TLS 1.3 key schedule (RFC 8446 §7.1) with DTLS 1.3 labels.
//!
//! ```text
//!          PSK or 0 -> HKDF-Extract = Early Secret
//!                        +--> "ext binder"  -> binder_key
//!                        v
//!                  Derive-Secret(., "derived", "")
//!                        v
//!          (EC)DHE -> HKDF-Extract = Handshake Secret
//!                        +--> "c hs traffic" / "s hs traffic"
//!                        v
//!                  Derive-Secret(., "derived", "")
//!                        v
//!                0 -> HKDF-Extract = Master Secret
//!                        +--> "c ap traffic" / "s ap traffic"
//! ```
//!
//! Traffic secrets leave this struct and are owned by the connection's
//! per-direction key state. Only the chain secret lives here.

use super::hkdf::{expand_label_secret, extract};
use super::{CipherSuite, Digest, HashAlgorithm, HmacContext, Secret};
use crate::Error;

#[derive(Debug)]
pub(crate) struct KeySchedule {
    hash: HashAlgorithm,
    /// Early secret until the handshake secret is mixed in.
    early: Secret,
    /// "derived" secret feeding the next extract.
    derived: Secret,
    /// Handshake secret kept until the application secrets are derived.
    handshake: Option<Secret>,
}

impl KeySchedule {
    pub fn new(suite: CipherSuite, psk: Option<&[u8]>) -> Result<Self, Error> {
        let hash = suite.hash_algorithm();
        let zeros = Secret::zeros(hash.output_len());
        let ikm: &[u8] = psk.unwrap_or(&zeros);

        let early = extract(hash, &zeros, ikm);
        let derived = expand_label_secret(hash, &early, b"derived", &suite.empty_hash())?;

        Ok(Self {
            hash,
            early,
            derived,
            handshake: None,
        })
    }

    /// Key for the PSK binder MAC (external PSK).
    pub fn binder_key(&self) -> Result<Secret, Error> {
        let empty = super::Hasher::new(self.hash).finalize();
        expand_label_secret(self.hash, &self.early, b"ext binder", &empty)
    }

    /// Mix in the (EC)DHE secret.
    ///
    /// Returns (client, server) handshake traffic secrets.
    pub fn handshake_secrets(
        &mut self,
        shared: &[u8],
        transcript_hash: &[u8],
    ) -> Result<(Secret, Secret), Error> {
        let handshake = extract(self.hash, &self.derived, shared);
        let client = expand_label_secret(self.hash, &handshake, b"c hs traffic", transcript_hash)?;
        let server = expand_label_secret(self.hash, &handshake, b"s hs traffic", transcript_hash)?;

        let empty = super::Hasher::new(self.hash).finalize();
        self.derived = expand_label_secret(self.hash, &handshake, b"derived", &empty)?;
        self.handshake = Some(handshake);

        Ok((client, server))
    }

    /// Returns (client, server) application traffic secrets.
    ///
    /// `transcript_hash` covers ClientHello..server Finished.
    pub fn application_secrets(
        &mut self,
        transcript_hash: &[u8],
    ) -> Result<(Secret, Secret), Error> {
        assert!(
            self.handshake.is_some(),
            "application secrets before handshake secrets"
        );
        let zeros = Secret::zeros(self.hash.output_len());
        let master = extract(self.hash, &self.derived, &zeros);
        let client = expand_label_secret(self.hash, &master, b"c ap traffic", transcript_hash)?;
        let server = expand_label_secret(self.hash, &master, b"s ap traffic", transcript_hash)?;
        self.handshake = None;
        Ok((client, server))
    }
}

/// HMAC(finished_key(base_key), transcript_hash).
///
/// Used for Finished verify_data and for PSK binders.
pub(crate) fn finished_mac(
    hash: HashAlgorithm,
    base_key: &[u8],
    transcript_hash: &[u8],
) -> Result<Digest, Error> {
    let finished_key = expand_label_secret(hash, base_key, b"finished", &[])?;
    let mut mac = HmacContext::new(hash, &finished_key)?;
    mac.update(transcript_hash);
    Ok(mac.finalize())
}

/// application_traffic_secret_N+1 (RFC 8446 §7.2).
pub(crate) fn next_traffic_secret(hash: HashAlgorithm, secret: &[u8]) -> Result<Secret, Error> {
    expand_label_secret(hash, secret, b"traffic upd", &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hasher;

    fn transcript(data: &[u8]) -> Digest {
        Hasher::digest(HashAlgorithm::Sha256, data)
    }

    #[test]
    fn both_sides_agree() {
        let suite = CipherSuite::Aes128GcmSha256;
        let mut a = KeySchedule::new(suite, None).unwrap();
        let mut b = KeySchedule::new(suite, None).unwrap();

        let th = transcript(b"hello");
        let (ca, sa) = a.handshake_secrets(&[7; 32], &th).unwrap();
        let (cb, sb) = b.handshake_secrets(&[7; 32], &th).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(sa, sb);
        assert_ne!(ca, sa);

        let th = transcript(b"hello..finished");
        let (ca2, sa2) = a.application_secrets(&th).unwrap();
        let (cb2, sb2) = b.application_secrets(&th).unwrap();
        assert_eq!(ca2, cb2);
        assert_eq!(sa2, sb2);
        assert_ne!(ca2, ca);
    }

    #[test]
    fn psk_changes_everything() {
        let suite = CipherSuite::Aes128GcmSha256;
        let mut a = KeySchedule::new(suite, None).unwrap();
        let mut b = KeySchedule::new(suite, Some(b"0123456789abcdef")).unwrap();
        let th = transcript(b"x");
        assert_ne!(
            a.handshake_secrets(&[1; 32], &th).unwrap().0,
            b.handshake_secrets(&[1; 32], &th).unwrap().0
        );
    }

    #[test]
    fn traffic_update_chain_is_deterministic() {
        let s0 = Secret::from_slice(&[3; 32]);
        let s1 = next_traffic_secret(HashAlgorithm::Sha256, &s0).unwrap();
        let s1b = next_traffic_secret(HashAlgorithm::Sha256, &s0).unwrap();
        let s2 = next_traffic_secret(HashAlgorithm::Sha256, &s1).unwrap();
        assert_eq!(s1, s1b);
        assert_ne!(s1, s0);
        assert_ne!(s2, s1);
    }

    #[test]
    fn finished_mac_binds_transcript() {
        let key = [9u8; 48];
        let a = finished_mac(HashAlgorithm::Sha384, &key, &[1; 48]).unwrap();
        let b = finished_mac(HashAlgorithm::Sha384, &key, &[2; 48]).unwrap();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }
}
