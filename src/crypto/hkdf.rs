//! HKDF with the DTLS 1.3 label prefix.

use hkdf::Hkdf;
use sha2::{Sha256, Sha384};

use zeroize::Zeroize;

use super::{HashAlgorithm, Secret, MAX_HASH_LEN};
use crate::Error;

/// DTLS 1.3 replaces the TLS 1.3 "tls13 " label prefix (RFC 9147 §5.9).
const LABEL_PREFIX: &[u8] = b"dtls13";

/// HKDF-Extract(salt, ikm).
pub(crate) fn extract(hash: HashAlgorithm, salt: &[u8], ikm: &[u8]) -> Secret {
    match hash {
        HashAlgorithm::Sha256 => {
            let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
            Secret::from_slice(&prk)
        }
        HashAlgorithm::Sha384 => {
            let (prk, _) = Hkdf::<Sha384>::extract(Some(salt), ikm);
            Secret::from_slice(&prk)
        }
    }
}

/// HKDF-Expand-Label(secret, label, context, out.len()) per RFC 8446 §7.1.
pub(crate) fn expand_label(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    let full_label_len = LABEL_PREFIX.len() + label.len();
    if full_label_len > 255 || context.len() > 255 || out.len() > u16::MAX as usize {
        return Err(Error::CryptoError("HKDF-Expand-Label input too long".into()));
    }

    // struct { uint16 length; opaque label<7..255>; opaque context<0..255>; } HkdfLabel;
    let mut info = [0u8; 2 + 1 + 255 + 1 + 255];
    let mut n = 0;
    info[..2].copy_from_slice(&(out.len() as u16).to_be_bytes());
    n += 2;
    info[n] = full_label_len as u8;
    n += 1;
    info[n..n + LABEL_PREFIX.len()].copy_from_slice(LABEL_PREFIX);
    n += LABEL_PREFIX.len();
    info[n..n + label.len()].copy_from_slice(label);
    n += label.len();
    info[n] = context.len() as u8;
    n += 1;
    info[n..n + context.len()].copy_from_slice(context);
    n += context.len();

    let failed = |_| Error::CryptoError("HKDF expand failed".into());
    match hash {
        HashAlgorithm::Sha256 => Hkdf::<Sha256>::from_prk(secret)
            .map_err(|_| Error::CryptoError("Invalid PRK".into()))?
            .expand(&info[..n], out)
            .map_err(failed),
        HashAlgorithm::Sha384 => Hkdf::<Sha384>::from_prk(secret)
            .map_err(|_| Error::CryptoError("Invalid PRK".into()))?
            .expand(&info[..n], out)
            .map_err(failed),
    }
}

/// Expand-Label producing a hash-length secret.
pub(crate) fn expand_label_secret(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
) -> Result<Secret, Error> {
    let len = hash.output_len();
    let mut buf = [0u8; MAX_HASH_LEN];
    expand_label(hash, secret, label, context, &mut buf[..len])?;
    let out = Secret::from_slice(&buf[..len]);
    buf.zeroize();
    Ok(out)
}
