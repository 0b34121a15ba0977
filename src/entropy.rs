//! Random bytes with a degraded fallback.
//!
//! The platform generator behind OpenSSL is always tried first. Hosts where
//! it fails get bytes from a SHA-256 mix of wall-clock time, a monotonic
//! clock and a process counter; those bytes are marked
//! [`Assurance::Degraded`] and must not be used for long-lived secrets.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assurance {
    Platform,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RandomBytes {
    pub bytes: Vec<u8>,
    pub assurance: Assurance,
}

static COUNTER: AtomicU64 = AtomicU64::new(0);
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Fill `len` bytes, preferring the platform generator.
pub fn random_bytes(len: usize) -> RandomBytes {
    let mut bytes = vec![0u8; len];
    match openssl::rand::rand_bytes(&mut bytes) {
        Ok(()) => RandomBytes {
            bytes,
            assurance: Assurance::Platform,
        },
        Err(e) => {
            warn!("platform RNG unavailable ({}), using degraded time-based source", e);
            RandomBytes {
                bytes: degraded_bytes(len),
                assurance: Assurance::Degraded,
            }
        }
    }
}

/// Whether the platform generator currently works.
pub fn platform_available() -> bool {
    let mut probe = [0u8; 16];
    openssl::rand::rand_bytes(&mut probe).is_ok()
}

/// Time and counter mixing for hosts without a platform generator.
pub fn degraded_bytes(len: usize) -> Vec<u8> {
    let epoch = *EPOCH.get_or_init(Instant::now);
    let mut out = Vec::with_capacity(len + 32);
    while out.len() < len {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mono = epoch.elapsed().as_nanos();
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(wall.to_le_bytes());
        hasher.update(mono.to_le_bytes());
        hasher.update(count.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());
    }
    out.truncate(len);
    out
}

/// Lowercase hex token of `len` random bytes.
pub fn random_hex(len: usize) -> String {
    hex::encode(random_bytes(len).bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_bytes() {
        let r = random_bytes(32);
        assert_eq!(r.bytes.len(), 32);
        assert_eq!(r.assurance, Assurance::Platform);
        assert!(platform_available());
    }

    #[test]
    fn test_degraded_bytes_length_and_variation() {
        let a = degraded_bytes(45);
        let b = degraded_bytes(45);
        assert_eq!(a.len(), 45);
        assert_ne!(a, b);
        assert!(degraded_bytes(0).is_empty());
    }

    #[test]
    fn test_random_hex() {
        let token = random_hex(16);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
