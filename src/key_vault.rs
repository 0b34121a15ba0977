//! Session-scoped RSA key pairs.
//!
//! Each (session, identity, label) owns at most one key pair for the life of
//! the session. Creation is serialized per slot so two concurrent first
//! requests cannot both generate a key; the loser gets the winner's record.
//! Certificate and PKCS#12 artifacts derived from a key pair are stored next
//! to it under the same lock discipline.

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::certificate_authority::{CertificateRecord, Pkcs12Bundle};
use crate::entropy;
use crate::error::{CryptoError, CryptoResult};
use crate::session::{SessionEntry, SessionId, SessionStore};

pub const DEFAULT_LABEL: &str = "default";

/// A session key pair. Private material never appears in `Debug` output.
pub struct KeyPairRecord {
    private_key: PKey<Private>,
    public_pem: String,
    pub identity: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl KeyPairRecord {
    pub fn generate(identity: &str, label: &str, bits: u32) -> CryptoResult<Self> {
        let rsa = Rsa::generate(bits)
            .map_err(|e| CryptoError::KeyGeneration(format!("RSA generation failed: {}", e)))?;
        let private_key = PKey::from_rsa(rsa)
            .map_err(|e| CryptoError::KeyGeneration(format!("key wrapping failed: {}", e)))?;
        Self::from_private_key(private_key, identity, label)
    }

    pub fn from_private_key(
        private_key: PKey<Private>,
        identity: &str,
        label: &str,
    ) -> CryptoResult<Self> {
        let public_pem = private_key
            .public_key_to_pem()
            .map_err(|e| CryptoError::InvalidKey(format!("public key export failed: {}", e)))
            .and_then(|pem| String::from_utf8(pem).map_err(|_| CryptoError::InvalidUtf8))?;
        Ok(Self {
            private_key,
            public_pem,
            identity: identity.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
        })
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn public_key(&self) -> CryptoResult<PKey<Public>> {
        PKey::public_key_from_pem(self.public_pem.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(format!("public key parse failed: {}", e)))
    }

    pub fn bits(&self) -> u32 {
        self.private_key.bits()
    }
}

impl fmt::Debug for KeyPairRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairRecord")
            .field("identity", &self.identity)
            .field("label", &self.label)
            .field("bits", &self.bits())
            .field("created_at", &self.created_at)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

type SlotKey = (SessionId, String, String);

pub struct KeyVault {
    sessions: Arc<dyn SessionStore>,
    rsa_bits: u32,
    locks: Mutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
    generated: AtomicU64,
}

fn slot(identity: &str, label: &str, kind: &str) -> String {
    format!("{}/{}/{}", identity, label, kind)
}

fn labels_slot(identity: &str) -> String {
    format!("{}/labels", identity)
}

impl KeyVault {
    pub fn new(sessions: Arc<dyn SessionStore>, rsa_bits: u32) -> Self {
        Self {
            sessions,
            rsa_bits,
            locks: Mutex::new(HashMap::new()),
            generated: AtomicU64::new(0),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Key pairs generated since construction or the last [`reset`](Self::reset).
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn get(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
    ) -> Option<Arc<KeyPairRecord>> {
        match self.sessions.get(session, &slot(identity, label, "keypair")) {
            Some(SessionEntry::KeyPair(record)) => Some(record),
            _ => None,
        }
    }

    /// Existing record for the slot, or a freshly generated one.
    pub fn get_or_create(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
    ) -> CryptoResult<Arc<KeyPairRecord>> {
        if let Some(record) = self.get(session, identity, label) {
            return Ok(record);
        }
        let lock = self.slot_lock(session, identity, label);
        let _guard = lock.lock();
        if let Some(record) = self.get(session, identity, label) {
            return Ok(record);
        }

        if !entropy::platform_available() {
            warn!(identity, "generating key pair with degraded entropy");
        }
        let record = Arc::new(KeyPairRecord::generate(identity, label, self.rsa_bits)?);
        self.sessions.set(
            session,
            &slot(identity, label, "keypair"),
            SessionEntry::KeyPair(Arc::clone(&record)),
        );
        self.push_label(session, identity, label);
        self.generated.fetch_add(1, Ordering::SeqCst);
        info!(identity, label, bits = self.rsa_bits, "generated session key pair");
        Ok(record)
    }

    /// Keyring labels for an identity, oldest first.
    pub fn labels(&self, session: &SessionId, identity: &str) -> Vec<String> {
        match self.sessions.get(session, &labels_slot(identity)) {
            Some(SessionEntry::Labels(labels)) => labels,
            _ => Vec::new(),
        }
    }

    /// Most recently added keyring label.
    pub fn latest_label(&self, session: &SessionId, identity: &str) -> Option<String> {
        self.labels(session, identity).pop()
    }

    pub fn certificate(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
    ) -> Option<Arc<CertificateRecord>> {
        match self.sessions.get(session, &slot(identity, label, "certificate")) {
            Some(SessionEntry::Certificate(record)) => Some(record),
            _ => None,
        }
    }

    /// Stored certificate for the slot, or one built by `build`.
    pub fn certificate_or_create<F>(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
        build: F,
    ) -> CryptoResult<Arc<CertificateRecord>>
    where
        F: FnOnce(&KeyPairRecord) -> CryptoResult<CertificateRecord>,
    {
        if let Some(record) = self.certificate(session, identity, label) {
            return Ok(record);
        }
        let keypair = self.get_or_create(session, identity, label)?;
        let lock = self.slot_lock(session, identity, label);
        let _guard = lock.lock();
        if let Some(record) = self.certificate(session, identity, label) {
            return Ok(record);
        }
        let record = Arc::new(build(&keypair)?);
        self.sessions.set(
            session,
            &slot(identity, label, "certificate"),
            SessionEntry::Certificate(Arc::clone(&record)),
        );
        Ok(record)
    }

    pub fn pkcs12(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
    ) -> Option<Arc<Pkcs12Bundle>> {
        match self.sessions.get(session, &slot(identity, label, "pkcs12")) {
            Some(SessionEntry::Pkcs12(bundle)) => Some(bundle),
            _ => None,
        }
    }

    /// Stored PKCS#12 bundle for the slot, or one exported by `export`.
    pub fn pkcs12_or_create<F>(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
        export: F,
    ) -> CryptoResult<Arc<Pkcs12Bundle>>
    where
        F: FnOnce(&KeyPairRecord) -> CryptoResult<Pkcs12Bundle>,
    {
        if let Some(bundle) = self.pkcs12(session, identity, label) {
            return Ok(bundle);
        }
        let keypair = self.get_or_create(session, identity, label)?;
        let lock = self.slot_lock(session, identity, label);
        let _guard = lock.lock();
        if let Some(bundle) = self.pkcs12(session, identity, label) {
            return Ok(bundle);
        }
        let bundle = Arc::new(export(&keypair)?);
        self.sessions.set(
            session,
            &slot(identity, label, "pkcs12"),
            SessionEntry::Pkcs12(Arc::clone(&bundle)),
        );
        Ok(bundle)
    }

    /// Replace the bundle for a slot, e.g. after a new PIN was supplied.
    /// The key pair and certificate it wraps are unchanged.
    pub fn store_pkcs12(
        &self,
        session: &SessionId,
        identity: &str,
        label: &str,
        bundle: Pkcs12Bundle,
    ) -> Arc<Pkcs12Bundle> {
        let bundle = Arc::new(bundle);
        let lock = self.slot_lock(session, identity, label);
        let _guard = lock.lock();
        self.sessions.set(
            session,
            &slot(identity, label, "pkcs12"),
            SessionEntry::Pkcs12(Arc::clone(&bundle)),
        );
        bundle
    }

    /// Drop everything held for a session.
    pub fn end_session(&self, session: &SessionId) {
        self.sessions.destroy(session);
        self.locks.lock().retain(|(sid, _, _), _| sid != session);
        info!(session = %session, "session key material destroyed");
    }

    /// End every session idle for at least `idle`. Returns how many were ended.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let expired = self.sessions.expired(idle);
        for session in &expired {
            self.end_session(session);
        }
        expired.len()
    }

    /// Drop all sessions and counters.
    pub fn reset(&self) {
        self.sessions.clear();
        self.locks.lock().clear();
        self.generated.store(0, Ordering::SeqCst);
    }

    fn slot_lock(&self, session: &SessionId, identity: &str, label: &str) -> Arc<Mutex<()>> {
        let key = (session.clone(), identity.to_string(), label.to_string());
        Arc::clone(self.locks.lock().entry(key).or_default())
    }

    // Called with the slot lock held; labels of other slots for the same
    // identity are guarded by the outer map lock below.
    fn push_label(&self, session: &SessionId, identity: &str, label: &str) {
        let _map = self.locks.lock();
        let mut labels = self.labels(session, identity);
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
            self.sessions
                .set(session, &labels_slot(identity), SessionEntry::Labels(labels));
        }
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVault")
            .field("rsa_bits", &self.rsa_bits)
            .field("generated", &self.generated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use std::thread;

    fn vault() -> KeyVault {
        KeyVault::new(Arc::new(MemorySessionStore::new()), 1024)
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let vault = vault();
        let sid = SessionId::generate();
        let first = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        let second = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.public_key_pem(), second.public_key_pem());
        assert_eq!(vault.generated_count(), 1);
        assert_eq!(first.bits(), 1024);
    }

    #[test]
    fn test_get_without_create() {
        let vault = vault();
        let sid = SessionId::generate();
        assert!(vault.get(&sid, "203.0.113.5", DEFAULT_LABEL).is_none());
        assert_eq!(vault.generated_count(), 0);
    }

    #[test]
    fn test_concurrent_first_requests_generate_once() {
        let vault = Arc::new(vault());
        let sid = SessionId::generate();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = Arc::clone(&vault);
                let sid = sid.clone();
                thread::spawn(move || {
                    vault
                        .get_or_create(&sid, "198.51.100.9", DEFAULT_LABEL)
                        .unwrap()
                        .public_key_pem()
                        .to_string()
                })
            })
            .collect();
        let pems: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pems.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(vault.generated_count(), 1);
    }

    #[test]
    fn test_keyring_labels_in_insertion_order() {
        let vault = vault();
        let sid = SessionId::generate();
        let a = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        let b = vault.get_or_create(&sid, "203.0.113.5", "alice@example.com").unwrap();
        assert_ne!(a.public_key_pem(), b.public_key_pem());
        assert_eq!(
            vault.labels(&sid, "203.0.113.5"),
            vec![DEFAULT_LABEL.to_string(), "alice@example.com".to_string()]
        );
        assert_eq!(
            vault.latest_label(&sid, "203.0.113.5").as_deref(),
            Some("alice@example.com")
        );
    }

    #[test]
    fn test_sessions_do_not_share_keys() {
        let vault = vault();
        let a = SessionId::generate();
        let b = SessionId::generate();
        let ka = vault.get_or_create(&a, "203.0.113.5", DEFAULT_LABEL).unwrap();
        let kb = vault.get_or_create(&b, "203.0.113.5", DEFAULT_LABEL).unwrap();
        assert_ne!(ka.public_key_pem(), kb.public_key_pem());
    }

    #[test]
    fn test_end_session_and_reset() {
        let vault = vault();
        let sid = SessionId::generate();
        let before = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        vault.end_session(&sid);
        assert!(vault.get(&sid, "203.0.113.5", DEFAULT_LABEL).is_none());
        let after = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        assert_ne!(before.public_key_pem(), after.public_key_pem());
        vault.reset();
        assert_eq!(vault.generated_count(), 0);
        assert!(vault.get(&sid, "203.0.113.5", DEFAULT_LABEL).is_none());
    }

    #[test]
    fn test_sweep_idle_ends_stale_sessions() {
        let vault = vault();
        let sid = SessionId::generate();
        let kp = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        assert_eq!(vault.sweep_idle(Duration::from_secs(3600)), 0);
        assert!(vault.get(&sid, "203.0.113.5", DEFAULT_LABEL).is_some());

        assert_eq!(vault.sweep_idle(Duration::ZERO), 1);
        assert!(!vault.sessions().exists(&sid));
        let again = vault.get_or_create(&sid, "203.0.113.5", DEFAULT_LABEL).unwrap();
        assert_ne!(kp.public_key_pem(), again.public_key_pem());
    }

    #[test]
    fn test_debug_no_leak() {
        let record = KeyPairRecord::generate("203.0.113.5", DEFAULT_LABEL, 1024).unwrap();
        let debug_str = format!("{:?}", record);
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("PRIVATE KEY"));
    }
}
