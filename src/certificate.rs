//! Self-signed certificate generation and fingerprints.
//!
//! Servers authenticate with an ECDSA P-256 certificate unless a PSK is
//! configured. This module produces one on the fly, which is what tests and
//! most peer-to-peer deployments want.

use std::fmt;

use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use sha2::{Digest, Sha256};

use crate::Error;

/// Certificate and private key pair.
#[derive(Clone)]
pub struct DtlsCertificate {
    /// Certificate in DER format.
    pub certificate: Vec<u8>,
    /// PKCS#8 private key in DER format.
    pub private_key: Vec<u8>,
}

/// Generate a self-signed ECDSA P-256 certificate.
pub fn generate_self_signed_certificate() -> Result<DtlsCertificate, Error> {
    let failed = |e: rcgen::RcgenError| Error::CryptoError(format!("Certificate generation: {}", e));

    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(failed)?;

    let mut params = CertificateParams::new(vec!["dtls13".to_string()]);
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "dtls13 peer");
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_pair = Some(key_pair);

    let cert = RcgenCertificate::from_params(params).map_err(failed)?;

    Ok(DtlsCertificate {
        certificate: cert.serialize_der().map_err(failed)?,
        private_key: cert.serialize_private_key_der(),
    })
}

/// SHA-256 over the DER certificate, formatted `AF:12:F6:...`.
pub fn fingerprint(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

impl DtlsCertificate {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.certificate)
    }
}

impl fmt::Debug for DtlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsCertificate")
            .field("fingerprint", &self.fingerprint())
            .field("private_key", &"<redacted>")
            .finish()
    }
}
