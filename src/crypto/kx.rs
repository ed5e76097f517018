//! Ephemeral (EC)DHE key exchange.

use std::fmt;

use arrayvec::ArrayVec;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use super::Secret;
use crate::Error;

/// Named groups (RFC 8446 §4.2.7) this engine can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    X25519,
    Secp256r1,
    Unknown(u16),
}

impl NamedGroup {
    /// Server preference order.
    pub const SUPPORTED: [NamedGroup; 2] = [NamedGroup::X25519, NamedGroup::Secp256r1];

    pub fn from_u16(value: u16) -> Self {
        match value {
            0x001D => NamedGroup::X25519,
            0x0017 => NamedGroup::Secp256r1,
            _ => NamedGroup::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            NamedGroup::X25519 => 0x001D,
            NamedGroup::Secp256r1 => 0x0017,
            NamedGroup::Unknown(v) => *v,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, NamedGroup::Unknown(_))
    }
}

/// Uncompressed P-256 point is the largest share.
pub type PublicShare = ArrayVec<u8, 65>;

/// One side's ephemeral keypair for one handshake.
pub enum KeyExchange {
    X25519 {
        secret: x25519_dalek::EphemeralSecret,
        public: PublicShare,
    },
    Secp256r1 {
        secret: p256::ecdh::EphemeralSecret,
        public: PublicShare,
    },
}

impl KeyExchange {
    pub fn new(group: NamedGroup) -> Result<Self, Error> {
        match group {
            NamedGroup::X25519 => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Ok(KeyExchange::X25519 {
                    secret,
                    public: public.as_bytes().iter().copied().collect(),
                })
            }
            NamedGroup::Secp256r1 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                Ok(KeyExchange::Secp256r1 {
                    secret,
                    public: point.as_bytes().iter().copied().collect(),
                })
            }
            NamedGroup::Unknown(v) => Err(Error::HandshakeFailure(format!(
                "Unsupported key exchange group {:#06x}",
                v
            ))),
        }
    }

    pub fn group(&self) -> NamedGroup {
        match self {
            KeyExchange::X25519 { .. } => NamedGroup::X25519,
            KeyExchange::Secp256r1 { .. } => NamedGroup::Secp256r1,
        }
    }

    pub fn public_key(&self) -> &[u8] {
        match self {
            KeyExchange::X25519 { public, .. } => public,
            KeyExchange::Secp256r1 { public, .. } => public,
        }
    }

    /// Combine with the peer's share. Consumes the ephemeral secret.
    pub fn complete(self, peer: &[u8]) -> Result<Secret, Error> {
        match self {
            KeyExchange::X25519 { secret, .. } => {
                let peer: [u8; 32] = peer.try_into().map_err(|_| {
                    Error::IllegalParameter("X25519 share must be 32 bytes".into())
                })?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err(Error::IllegalParameter("Non-contributory X25519 share".into()));
                }
                Ok(Secret::from_slice(shared.as_bytes()))
            }
            KeyExchange::Secp256r1 { secret, .. } => {
                let peer = p256::PublicKey::from_sec1_bytes(peer)
                    .map_err(|_| Error::IllegalParameter("Invalid P-256 share".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Secret::from_slice(shared.raw_secret_bytes()))
            }
        }
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyExchange").field(&self.group()).finish()
    }
}
