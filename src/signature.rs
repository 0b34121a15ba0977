//! Raw asymmetric signatures outside the PKCS#7 envelope.
//!
//! Library API only: the gateway's `do=` operations always sign and verify
//! through S/MIME in [`certificate_authority`](crate::certificate_authority).
//! Callers holding a session [`KeyPairRecord`](crate::key_vault::KeyPairRecord)
//! can use these for detached base64 signatures.

use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPrivate, HasPublic, PKeyRef};
use openssl::sign::{Signer, Verifier};
use serde::Deserialize;

use crate::error::{CryptoError, CryptoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha256,
    Sha384,
    #[default]
    Sha512,
}

impl SignatureAlgorithm {
    pub fn parse(name: &str) -> CryptoResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            "sha384" => Ok(SignatureAlgorithm::Sha384),
            "sha512" => Ok(SignatureAlgorithm::Sha512),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            SignatureAlgorithm::Sha256 => MessageDigest::sha256(),
            SignatureAlgorithm::Sha384 => MessageDigest::sha384(),
            SignatureAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Base64 signature of `data`.
pub fn sign<T: HasPrivate>(
    data: &[u8],
    key: &PKeyRef<T>,
    algorithm: SignatureAlgorithm,
) -> CryptoResult<String> {
    let mut signer = Signer::new(algorithm.message_digest(), key)
        .map_err(|e| CryptoError::Signature(format!("Failed to create signer: {}", e)))?;
    let signature = signer
        .sign_oneshot_to_vec(data)
        .map_err(|e| CryptoError::Signature(format!("Failed to sign data: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(signature))
}

/// Check a base64 signature. Undecodable or mismatching signatures are `false`.
pub fn verify<T: HasPublic>(
    data: &[u8],
    signature: &str,
    key: &PKeyRef<T>,
    algorithm: SignatureAlgorithm,
) -> CryptoResult<bool> {
    let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return Ok(false);
    };
    let mut verifier = Verifier::new(algorithm.message_digest(), key)
        .map_err(|e| CryptoError::Signature(format!("Failed to create verifier: {}", e)))?;
    Ok(verifier.verify_oneshot(&raw, data).unwrap_or(false))
}
