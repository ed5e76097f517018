//! ECDSA P-256 signing and certificate-based verification.

use std::fmt;

use der::Decode;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, VerifyingKey};
use pkcs8::DecodePrivateKey;
use spki::ObjectIdentifier;
use x509_cert::Certificate as X509Certificate;

use crate::buffer::Buf;
use crate::Error;

/// SignatureScheme ecdsa_secp256r1_sha256 (RFC 8446 §4.2.3).
pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// Private key used for CertificateVerify.
pub struct SigningKey(p256::ecdsa::SigningKey);

impl SigningKey {
    /// Load a PKCS#8 DER encoded P-256 private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, Error> {
        let key = p256::ecdsa::SigningKey::from_pkcs8_der(der)
            .map_err(|e| Error::ConfigError(format!("Failed to parse private key: {}", e)))?;
        Ok(Self(key))
    }

    pub fn scheme(&self) -> u16 {
        ECDSA_SECP256R1_SHA256
    }

    /// DER encoded signature over `message` (hashed with SHA-256).
    pub fn sign(&self, message: &[u8], out: &mut Buf) {
        let signature: Signature = self.0.sign(message);
        out.extend_from_slice(signature.to_der().as_bytes());
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(P-256)")
    }
}

/// Verify `signature` over `message` with the public key of `cert_der`.
pub fn verify_signature(
    cert_der: &[u8],
    scheme: u16,
    message: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    if scheme != ECDSA_SECP256R1_SHA256 {
        return Err(Error::IllegalParameter(format!(
            "Unsupported signature scheme {:#06x}",
            scheme
        )));
    }

    let key = public_key_of(cert_der)?;
    let signature = Signature::from_der(signature)
        .map_err(|_| Error::DecodeError("Invalid ECDSA signature encoding".into()))?;

    key.verify(message, &signature)
        .map_err(|_| Error::SecurityError("CertificateVerify signature mismatch".into()))
}

fn public_key_of(cert_der: &[u8]) -> Result<VerifyingKey, Error> {
    let cert = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::BadCertificate(format!("Failed to parse certificate: {}", e)))?;
    let spki = &cert.tbs_certificate.subject_public_key_info;

    if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
        return Err(Error::BadCertificate(format!(
            "Unsupported public key algorithm: {}",
            spki.algorithm.oid
        )));
    }

    let curve: ObjectIdentifier = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::BadCertificate("Missing EC curve parameter".into()))?
        .decode_as()
        .map_err(|_| Error::BadCertificate("Invalid EC curve parameter".into()))?;

    if curve != OID_P256 {
        return Err(Error::BadCertificate(format!("Unsupported EC curve: {}", curve)));
    }

    let point = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::BadCertificate("Invalid subject public key".into()))?;

    VerifyingKey::from_sec1_bytes(point)
        .map_err(|_| Error::BadCertificate("Invalid P-256 public key".into()))
}
