//! Pre-decryption request validation.
//!
//! Three checks run in order and the first failure stops the request: the
//! programmatic-call marker, the application token bound to the session, and
//! a checksum over the canonical body string. Nothing here touches key
//! material.

use base64::Engine;
use http::HeaderMap;
use openssl::hash::{hash, MessageDigest};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::configs::IntegrityConfig;
use crate::error::{CryptoError, CryptoResult, IntegrityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// Accepted for legacy clients only.
    Md5,
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Md5 => MessageDigest::md5(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn digest(self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        hash(self.message_digest(), data)
            .map(|d| d.to_vec())
            .map_err(|e| CryptoError::Signature(format!("digest failed: {}", e)))
    }
}

/// `k1=v1&k2=v2` in received order, no escaping, no sorting.
///
/// An empty body canonicalizes to the session token.
pub fn canonical_body<'a, I>(fields: I, session_token: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let joined = fields
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    if joined.is_empty() {
        session_token.to_string()
    } else {
        joined
    }
}

/// Value for the checksum header: base64 of the raw digest.
pub fn checksum(algorithm: DigestAlgorithm, canonical: &str) -> CryptoResult<String> {
    let digest = algorithm.digest(canonical.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Header pairs a client attaches so that `fields` pass the gate.
pub fn integrity_headers(
    config: &IntegrityConfig,
    token: &str,
    fields: &[(String, String)],
) -> CryptoResult<Vec<(String, String)>> {
    let canonical = canonical_body(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())), token);
    Ok(vec![
        (config.marker_header.clone(), config.marker_value.clone()),
        (config.token_header.clone(), token.to_string()),
        (config.checksum_header.clone(), checksum(config.digest, &canonical)?),
    ])
}

#[derive(Debug, Clone)]
pub struct IntegrityGate {
    config: IntegrityConfig,
}

impl IntegrityGate {
    pub fn new(config: IntegrityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Validate marker, token and checksum, in that order.
    pub fn check(
        &self,
        headers: &HeaderMap,
        fields: &[(String, String)],
        session_token: Option<&str>,
    ) -> Result<(), IntegrityError> {
        let marker = header_str(headers, &self.config.marker_header);
        if marker != Some(self.config.marker_value.as_str()) {
            warn!("integrity: missing programmatic-call marker");
            return Err(IntegrityError::MissingMarker);
        }

        let session_token = session_token.ok_or(IntegrityError::UnboundSession)?;
        let supplied = header_str(headers, &self.config.token_header).unwrap_or("");
        if !constant_time_eq(supplied.as_bytes(), session_token.as_bytes()) {
            warn!("integrity: application token mismatch");
            return Err(IntegrityError::TokenMismatch);
        }

        let supplied = header_str(headers, &self.config.checksum_header)
            .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
            .ok_or(IntegrityError::MalformedChecksum)?;
        let canonical = canonical_body(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            session_token,
        );
        let expected = self
            .config
            .digest
            .digest(canonical.as_bytes())
            .map_err(|_| IntegrityError::ChecksumMismatch)?;
        if !constant_time_eq(&supplied, &expected) {
            warn!("integrity: checksum mismatch");
            return Err(IntegrityError::ChecksumMismatch);
        }
        debug!(fields = fields.len(), "integrity checks passed");
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}
