//! Self-signed RSA-2048 certificate generation for the DTLS handshake
//! (§3, §4.4), matching the original's `KeyAndCert` (30-day validity
//! window, SHA-256 certificate digest for out-of-band pinning).
//!
//! `rcgen` (the teacher's certificate crate, see `server/src/tls.rs`) only
//! *generates* ECDSA/Ed25519 key pairs, but it can sign a certificate over
//! an externally supplied key of any type it recognizes — so the RSA-2048
//! key material itself comes from the `rsa` crate, PKCS#8-DER-encoded, and
//! handed to `rcgen::KeyPair::from_pkcs8_der_and_sign_algo`.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::error::KeyAndCertError;

const RSA_KEY_BITS: usize = 2048;
const VALID_BACK_DAYS: i64 = 1;
const VALID_FORWARD_DAYS: i64 = 30;

/// A freshly generated self-signed certificate plus its signing key and
/// SHA-256 digest, ready to hand to `dimpl::DtlsCertificate`.
pub struct KeyAndCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub digest: [u8; 32],
}

impl KeyAndCert {
    /// Generate a new RSA-2048 self-signed certificate valid from one day
    /// ago to 30 days from now — the back-dated start tolerates modest
    /// clock skew between host and viewer.
    pub fn generate() -> Result<Self, KeyAndCertError> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| KeyAndCertError::KeyGeneration(e.to_string()))?;
        let key_der = private_key
            .to_pkcs8_der()
            .map_err(|e| KeyAndCertError::KeyGeneration(e.to_string()))?
            .as_bytes()
            .to_vec();

        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der.clone().into(), &PKCS_RSA_SHA256)
            .map_err(|e| KeyAndCertError::CertGeneration(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| KeyAndCertError::CertGeneration(e.to_string()))?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, "Beam");
        params.distinguished_name = subject;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(VALID_BACK_DAYS);
        params.not_after = now + Duration::days(VALID_FORWARD_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| KeyAndCertError::CertGeneration(e.to_string()))?;
        let cert_der = cert.der().to_vec();

        let digest: [u8; 32] = Sha256::digest(&cert_der).into();

        Ok(Self {
            cert_der,
            key_der,
            digest,
        })
    }

    pub fn digest_hex(&self) -> String {
        hex_encode(&self.digest)
    }
}

/// Compute the SHA-256 digest of a peer's DER certificate, for comparison
/// against a pinned digest received out-of-band via signaling.
pub fn digest_of(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

pub fn parse_pinned_digest(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
