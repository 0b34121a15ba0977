//! Server session store.
//!
//! All per-client cryptographic state lives in a session, keyed by slot
//! name. Destroying a session drops every record it holds. Sessions record
//! when they were last used so idle ones can be swept.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::certificate_authority::{CertificateRecord, Pkcs12Bundle};
use crate::entropy;
use crate::key_vault::KeyPairRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random session id.
    pub fn generate() -> Self {
        SessionId(entropy::random_hex(16))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEntry {
    Token(String),
    KeyPair(Arc<KeyPairRecord>),
    Certificate(Arc<CertificateRecord>),
    Pkcs12(Arc<Pkcs12Bundle>),
    /// Keyring labels in insertion order.
    Labels(Vec<String>),
}

pub trait SessionStore: Send + Sync {
    fn exists(&self, session: &SessionId) -> bool;
    /// Create an empty session; a no-op when it already exists.
    fn open(&self, session: &SessionId);
    fn get(&self, session: &SessionId, slot: &str) -> Option<SessionEntry>;
    fn set(&self, session: &SessionId, slot: &str, entry: SessionEntry);
    fn delete(&self, session: &SessionId, slot: &str) -> Option<SessionEntry>;
    /// Mark the session as used now.
    fn touch(&self, session: &SessionId);
    /// Sessions unused for at least `idle`.
    fn expired(&self, idle: Duration) -> Vec<SessionId>;
    /// Tear down the session and everything in it.
    fn destroy(&self, session: &SessionId);
    /// Tear down all sessions.
    fn clear(&self);
}

pub const TOKEN_SLOT: &str = "token";

struct SessionSlots {
    slots: HashMap<String, SessionEntry>,
    last_seen: Instant,
}

impl Default for SessionSlots {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            last_seen: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionSlots>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn exists(&self, session: &SessionId) -> bool {
        self.sessions.read().contains_key(session)
    }

    fn open(&self, session: &SessionId) {
        self.sessions.write().entry(session.clone()).or_default();
    }

    fn get(&self, session: &SessionId, slot: &str) -> Option<SessionEntry> {
        self.sessions
            .read()
            .get(session)
            .and_then(|s| s.slots.get(slot).cloned())
    }

    fn set(&self, session: &SessionId, slot: &str, entry: SessionEntry) {
        self.sessions
            .write()
            .entry(session.clone())
            .or_default()
            .slots
            .insert(slot.to_string(), entry);
    }

    fn delete(&self, session: &SessionId, slot: &str) -> Option<SessionEntry> {
        self.sessions
            .write()
            .get_mut(session)
            .and_then(|s| s.slots.remove(slot))
    }

    fn touch(&self, session: &SessionId) {
        if let Some(s) = self.sessions.write().get_mut(session) {
            s.last_seen = Instant::now();
        }
    }

    fn expired(&self, idle: Duration) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() >= idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn destroy(&self, session: &SessionId) {
        self.sessions.write().remove(session);
    }

    fn clear(&self) {
        self.sessions.write().clear();
    }
}

impl fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("sessions", &self.len())
            .finish()
    }
}

/// Token bound to the session, if any.
pub fn session_token(store: &dyn SessionStore, session: &SessionId) -> Option<String> {
    match store.get(session, TOKEN_SLOT) {
        Some(SessionEntry::Token(token)) => Some(token),
        _ => None,
    }
}
