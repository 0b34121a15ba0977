//! Client-resident cache of the server's public key and certificate.
//!
//! Values are AES-wrapped with a per-client pseudonym (UUID) as the password
//! and a random IV string as the salt. The four slots only make sense
//! together, so they are created and removed as a unit.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::chunked_cipher::{aes_decrypt, aes_encrypt, SymmetricCipher};
use crate::entropy;
use crate::error::{ClientError, CryptoError, CryptoResult, StorageError};

pub const UUID_SLOT: &str = "uuid";
pub const IV_SLOT: &str = "iv";
pub const PUBLIC_KEY_SLOT: &str = "pub";
pub const CERTIFICATE_SLOT: &str = "certificate";

const COOKIE_TTL_DAYS: i64 = 7;

/// Requested storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    /// JSON file that survives restarts.
    Durable(PathBuf),
    /// Lives as long as the process.
    Session,
    /// Process-local with a seven day expiry.
    Cookie,
}

pub trait CacheBackend: Send {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&mut self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub struct DurableStorage {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl DurableStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(StorageError::Unavailable("durable"));
            }
        }
        let entries = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<(), StorageError> {
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

impl CacheBackend for DurableStorage {
    fn name(&self) -> &'static str {
        "durable"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SessionStorage {
    entries: HashMap<String, String>,
}

impl CacheBackend for SessionStorage {
    fn name(&self) -> &'static str {
        "session"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug)]
pub struct CookieStorage {
    ttl: Duration,
    entries: HashMap<String, (String, DateTime<Utc>)>,
}

impl CookieStorage {
    pub fn new() -> Self {
        Self::with_ttl(Duration::days(COOKIE_TTL_DAYS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }
}

impl Default for CookieStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for CookieStorage {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|(_, expires)| Utc::now() < *expires)
            .map(|(value, _)| value.clone())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let expires = Utc::now() + self.ttl;
        self.entries
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Open the requested backend, falling back to cookie storage.
pub fn select_backend(kind: &StorageKind) -> Box<dyn CacheBackend> {
    match kind {
        StorageKind::Durable(path) => match DurableStorage::open(path) {
            Ok(storage) => Box::new(storage),
            Err(e) => {
                warn!(path = %path.display(), "durable storage unavailable ({}), using cookie storage", e);
                Box::new(CookieStorage::new())
            }
        },
        StorageKind::Session => Box::new(SessionStorage::default()),
        StorageKind::Cookie => Box::new(CookieStorage::new()),
    }
}

/// AES-wrap `value` under the pseudonym pair.
pub fn wrap(value: &str, uuid: &str, iv: &str) -> CryptoResult<String> {
    aes_encrypt(value.as_bytes(), uuid, iv, SymmetricCipher::Aes256Cbc)
}

pub fn unwrap(wrapped: &str, uuid: &str, iv: &str) -> CryptoResult<String> {
    let bytes = aes_decrypt(wrapped, uuid, iv, SymmetricCipher::Aes256Cbc)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::InvalidUtf8)
}

pub struct ClientKeyCache {
    backend: Box<dyn CacheBackend>,
}

impl ClientKeyCache {
    pub fn new(kind: &StorageKind) -> Self {
        Self::with_backend(select_backend(kind))
    }

    pub fn with_backend(backend: Box<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The (uuid, iv) pair, generated on first use.
    ///
    /// A missing pair also drops any wrapped values, which can no longer be
    /// opened.
    pub fn pseudonym(&mut self) -> Result<(String, String), StorageError> {
        if let (Some(uuid), Some(iv)) = (self.backend.get(UUID_SLOT), self.backend.get(IV_SLOT)) {
            return Ok((uuid, iv));
        }
        self.clear()?;
        let uuid = uuid::Uuid::new_v4().to_string();
        let iv = entropy::random_hex(16);
        self.backend.set(UUID_SLOT, &uuid)?;
        self.backend.set(IV_SLOT, &iv)?;
        debug!(backend = self.backend.name(), "generated client pseudonym");
        Ok((uuid, iv))
    }

    pub fn public_key(&self) -> Option<String> {
        self.read_wrapped(PUBLIC_KEY_SLOT)
    }

    pub fn store_public_key(&mut self, pem: &str) -> Result<(), ClientError> {
        self.write_wrapped(PUBLIC_KEY_SLOT, pem)
    }

    pub fn certificate(&self) -> Option<String> {
        self.read_wrapped(CERTIFICATE_SLOT)
    }

    pub fn store_certificate(&mut self, certificate: &str) -> Result<(), ClientError> {
        self.write_wrapped(CERTIFICATE_SLOT, certificate)
    }

    /// Remove the pseudonym and everything wrapped under it.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        for slot in [UUID_SLOT, IV_SLOT, PUBLIC_KEY_SLOT, CERTIFICATE_SLOT] {
            self.backend.delete(slot)?;
        }
        Ok(())
    }

    fn read_wrapped(&self, slot: &str) -> Option<String> {
        let uuid = self.backend.get(UUID_SLOT)?;
        let iv = self.backend.get(IV_SLOT)?;
        let wrapped = self.backend.get(slot)?;
        match unwrap(&wrapped, &uuid, &iv) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(slot, "cached value unreadable, treating as miss: {}", e);
                None
            }
        }
    }

    fn write_wrapped(&mut self, slot: &str, value: &str) -> Result<(), ClientError> {
        let (uuid, iv) = self.pseudonym()?;
        let wrapped = wrap(value, &uuid, &iv)?;
        self.backend.set(slot, &wrapped)?;
        Ok(())
    }
}

impl std::fmt::Debug for ClientKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeyCache")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nMIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC\n-----END PUBLIC KEY-----\n";

    #[test]
    fn test_wrap_roundtrip_and_wrong_pseudonym() {
        let wrapped = wrap(PEM, "uuid-a", "iv-a").unwrap();
        assert!(!wrapped.contains("PUBLIC KEY"));
        assert_eq!(unwrap(&wrapped, "uuid-a", "iv-a").unwrap(), PEM);
        assert_ne!(unwrap(&wrapped, "uuid-b", "iv-a").ok().as_deref(), Some(PEM));
    }

    #[test]
    fn test_cache_hit_after_store() {
        let mut cache = ClientKeyCache::new(&StorageKind::Session);
        assert!(cache.public_key().is_none());
        cache.store_public_key(PEM).unwrap();
        assert_eq!(cache.public_key().as_deref(), Some(PEM));
        assert!(cache.certificate().is_none());
        cache.store_certificate("Y2VydA==").unwrap();
        assert_eq!(cache.certificate().as_deref(), Some("Y2VydA=="));
    }

    #[test]
    fn test_clear_removes_all_slots() {
        let mut cache = ClientKeyCache::new(&StorageKind::Session);
        cache.store_public_key(PEM).unwrap();
        let (uuid, _) = cache.pseudonym().unwrap();
        cache.clear().unwrap();
        assert!(cache.public_key().is_none());
        let (fresh, _) = cache.pseudonym().unwrap();
        assert_ne!(uuid, fresh);
    }

    #[test]
    fn test_durable_storage_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        {
            let mut cache = ClientKeyCache::new(&StorageKind::Durable(path.clone()));
            assert_eq!(cache.backend_name(), "durable");
            cache.store_public_key(PEM).unwrap();
        }
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("BEGIN PUBLIC KEY"));
        let cache = ClientKeyCache::new(&StorageKind::Durable(path));
        assert_eq!(cache.public_key().as_deref(), Some(PEM));
    }

    #[test]
    fn test_unavailable_durable_falls_back_to_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("keys.json");
        let cache = ClientKeyCache::new(&StorageKind::Durable(path));
        assert_eq!(cache.backend_name(), "cookie");
    }

    #[test]
    fn test_cookie_expiry() {
        let mut storage = CookieStorage::with_ttl(Duration::seconds(-1));
        storage.set("pub", "value").unwrap();
        assert!(storage.get("pub").is_none());
        let mut storage = CookieStorage::new();
        storage.set("pub", "value").unwrap();
        assert_eq!(storage.get("pub").as_deref(), Some("value"));
    }
}
