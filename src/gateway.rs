//! Server request flow.
//!
//! [`Gateway::handle`] is transport independent and blocking: it resolves the
//! client identity, runs the integrity gate before touching any key, and then
//! dispatches on the control fields of the body. Every outcome, including
//! failures, becomes a JSON [`Response`] with a status code.

use base64::Engine;
use http::{HeaderMap, StatusCode};
use openssl::x509::X509;
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::certificate_authority::{
    decrypt_verify_pkcs7, encrypt_sign_pkcs7, import_pkcs12, sign_pkcs7, verify_pkcs7,
    CertificateAuthority, CertificateRecord,
};
use crate::chunked_cipher::{ChunkedCipher, PlainField};
use crate::configs::AppConfig;
use crate::error::{CryptoError, Error, Result};
use crate::identity::{ClientIdentity, IdentityResolver};
use crate::integrity::{canonical_body, IntegrityGate};
use crate::key_vault::{KeyPairRecord, KeyVault, DEFAULT_LABEL};
use crate::protocol::{
    self, Operation, ParsedBody, Request, Response, EMAIL_FIELD, MESSAGE_FIELD, PIN_FIELD,
};
use crate::session::{session_token, SessionEntry, SessionId, SessionStore, TOKEN_SLOT};

/// Receives the decrypted fields of a plain submission.
pub trait FormProcessor: Send + Sync {
    fn process(
        &self,
        identity: &ClientIdentity,
        fields: &[(String, PlainField)],
    ) -> anyhow::Result<Value>;
}

/// Accepts every submission and answers `true`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Acknowledge;

impl FormProcessor for Acknowledge {
    fn process(&self, _: &ClientIdentity, _: &[(String, PlainField)]) -> anyhow::Result<Value> {
        Ok(Value::Bool(true))
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub session: SessionId,
    /// Address of the directly connected peer.
    pub peer: Option<String>,
    pub headers: HeaderMap,
    /// Form pairs in received order.
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: Response,
}

impl GatewayResponse {
    pub fn to_json(&self) -> Value {
        self.body.to_json()
    }
}

pub struct Gateway {
    resolver: IdentityResolver,
    gate: IntegrityGate,
    vault: Arc<KeyVault>,
    authority: CertificateAuthority,
    cipher: ChunkedCipher,
    processor: Arc<dyn FormProcessor>,
    app_token: String,
    session_idle: Duration,
    debug: bool,
}

impl Gateway {
    pub fn new(config: &AppConfig, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            resolver: IdentityResolver::new(),
            gate: IntegrityGate::new(config.integrity.clone()),
            vault: Arc::new(KeyVault::new(sessions, config.keys.rsa_bits)),
            authority: CertificateAuthority::new(config.certificate.clone()),
            cipher: ChunkedCipher::new(config.keys.chunk_size, config.keys.padding),
            processor: Arc::new(Acknowledge),
            app_token: config.integrity.app_token.clone(),
            session_idle: config.server.session_idle(),
            debug: config.server.debug,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn FormProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn vault(&self) -> &Arc<KeyVault> {
        &self.vault
    }

    pub fn cipher(&self) -> ChunkedCipher {
        self.cipher
    }

    /// Resolve the session a request belongs to.
    ///
    /// Unknown ids are never adopted; the caller gets a fresh id instead.
    /// Nothing is stored until the request passes the integrity gate.
    pub fn open_session(&self, existing: Option<&str>) -> SessionId {
        existing
            .map(SessionId::from)
            .filter(|s| self.vault.sessions().exists(s))
            .unwrap_or_else(SessionId::generate)
    }

    pub fn has_session(&self, session: &SessionId) -> bool {
        self.vault.sessions().exists(session)
    }

    pub fn end_session(&self, session: &SessionId) {
        self.vault.end_session(session);
    }

    /// End sessions idle longer than the configured limit.
    pub fn sweep_idle_sessions(&self) -> usize {
        self.vault.sweep_idle(self.session_idle)
    }

    // Binds the app token on first use; later requests only refresh activity.
    fn bind_session(&self, session: &SessionId) {
        let sessions = self.vault.sessions();
        if session_token(sessions.as_ref(), session).is_none() {
            sessions.set(session, TOKEN_SLOT, SessionEntry::Token(self.app_token.clone()));
            debug!(session = %session, "session opened");
        }
        sessions.touch(session);
    }

    pub fn handle(&self, request: &InboundRequest) -> GatewayResponse {
        match self.dispatch(request) {
            Ok(body) => GatewayResponse {
                status: StatusCode::OK,
                body,
            },
            Err(err) => self.reject(request, err),
        }
    }

    fn dispatch(&self, request: &InboundRequest) -> Result<Response> {
        let identity = self
            .resolver
            .resolve(&request.headers, request.peer.as_deref())?;
        let token = session_token(self.vault.sessions().as_ref(), &request.session)
            .unwrap_or_else(|| self.app_token.clone());
        self.gate
            .check(&request.headers, &request.fields, Some(token.as_str()))?;
        self.bind_session(&request.session);

        let body = protocol::parse_body(&request.fields)?;
        let session = &request.session;
        match &body.request {
            Request::PublicKey { uuid, .. } => {
                debug!(identity = identity.as_str(), uuid = ?uuid, "public key requested");
                let record = self
                    .vault
                    .get_or_create(session, identity.as_str(), DEFAULT_LABEL)?;
                Ok(Response::PublicKey {
                    success: true,
                    key: record.public_key_pem().to_string(),
                })
            }
            Request::Certificate => self.certificate(session, identity.as_str(), &body),
            Request::Operation {
                operation,
                certificate,
            } => self.operation(
                session,
                identity.as_str(),
                *operation,
                certificate.as_deref(),
                &body,
            ),
            Request::Submit => self.submit(session, &identity, &body),
        }
    }

    fn certificate(&self, session: &SessionId, identity: &str, body: &ParsedBody) -> Result<Response> {
        let key = self.session_key(session, identity)?;
        let label = self
            .decrypt_text(&key, body, EMAIL_FIELD)?
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());
        let pin = self
            .decrypt_text(&key, body, PIN_FIELD)?
            .filter(|pin| !pin.is_empty());

        let keypair = self.vault.get_or_create(session, identity, &label)?;
        let cert = self
            .vault
            .certificate_or_create(session, identity, &label, |kp| self.authority.issue(kp))?;
        match pin {
            Some(pin) => {
                let bundle = self
                    .authority
                    .export(&cert, &keypair, &SecretString::from(pin))?;
                self.vault.store_pkcs12(session, identity, &label, bundle);
            }
            None => {
                let passphrase = SecretString::from(identity.to_string());
                self.vault.pkcs12_or_create(session, identity, &label, |kp| {
                    self.authority.export(&cert, kp, &passphrase)
                })?;
            }
        }
        info!(identity, label = %label, "certificate issued");
        Ok(Response::Certificate {
            success: true,
            certificate: base64::engine::general_purpose::STANDARD.encode(cert.pem()),
        })
    }

    fn operation(
        &self,
        session: &SessionId,
        identity: &str,
        operation: Operation,
        presented: Option<&str>,
        body: &ParsedBody,
    ) -> Result<Response> {
        let key = self.session_key(session, identity)?;
        debug!(identity, operation = operation.as_str(), "operation requested");
        match operation {
            Operation::Sign => {
                let cert = self.default_certificate(session, identity)?.x509()?;
                let message = self.message_or_fields(&key, body)?;
                Ok(Response::Signed {
                    success: true,
                    signed: sign_pkcs7(message.as_bytes(), &cert, key.private_key())?,
                })
            }
            Operation::Verify => {
                let message = self.require_text(&key, body, MESSAGE_FIELD)?;
                let trusted = self.trusted_certificates(session, identity)?;
                let verified = !trusted.is_empty()
                    && verify_pkcs7(&message, &trusted)
                        .map(|result| result.verified)
                        .unwrap_or(false);
                Ok(Response::Verified {
                    verified,
                    message: None,
                })
            }
            Operation::EncryptSign => {
                let cert = self.default_certificate(session, identity)?.x509()?;
                let message = self.message_or_fields(&key, body)?;
                Ok(Response::Envelope {
                    success: true,
                    message: encrypt_sign_pkcs7(message.as_bytes(), &cert, key.private_key())?,
                })
            }
            Operation::DecryptVerify => {
                let cert = self.default_certificate(session, identity)?.x509()?;
                let message = self.require_text(&key, body, MESSAGE_FIELD)?;
                match decrypt_verify_pkcs7(&message, &cert, key.private_key()) {
                    Ok(opened) if opened.verified => Ok(Response::Verified {
                        verified: true,
                        message: Some(String::from_utf8_lossy(&opened.content).into_owned()),
                    }),
                    Ok(_) | Err(_) => Ok(Response::Verified {
                        verified: false,
                        message: None,
                    }),
                }
            }
            Operation::Authenticate => Ok(Response::Authenticate {
                authenticated: self.authenticate(session, identity, presented, &key, body)?,
            }),
        }
    }

    /// PIN opens the latest keyring bundle and its certificate is the
    /// session certificate (and the presented one, when given).
    fn authenticate(
        &self,
        session: &SessionId,
        identity: &str,
        presented: Option<&str>,
        key: &KeyPairRecord,
        body: &ParsedBody,
    ) -> Result<bool> {
        let Some(pin) = self.decrypt_text(key, body, PIN_FIELD)? else {
            return Ok(false);
        };
        let label = self
            .vault
            .latest_label(session, identity)
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());
        let (Some(bundle), Some(stored)) = (
            self.vault.pkcs12(session, identity, &label),
            self.vault.certificate(session, identity, &label),
        ) else {
            debug!(identity, label = %label, "no bundle to authenticate against");
            return Ok(false);
        };

        let imported = match import_pkcs12(&bundle, &SecretString::from(pin)) {
            Ok(imported) => imported,
            Err(e) => {
                warn!(identity, "authentication failed: {}", e);
                return Ok(false);
            }
        };
        if !stored.matches(&imported.certificate) {
            return Ok(false);
        }
        if let Some(presented) = presented {
            let matches = base64::engine::general_purpose::STANDARD
                .decode(presented.trim())
                .ok()
                .and_then(|pem| X509::from_pem(&pem).ok())
                .map(|cert| stored.matches(&cert))
                .unwrap_or(false);
            if !matches {
                return Ok(false);
            }
        }
        info!(identity, label = %label, "client authenticated");
        Ok(true)
    }

    fn submit(&self, session: &SessionId, identity: &ClientIdentity, body: &ParsedBody) -> Result<Response> {
        let key = self.session_key(session, identity.as_str())?;
        let opened = self.open_fields(&key, body)?;
        let value = self
            .processor
            .process(identity, &opened)
            .map_err(|e| Error::Processing(e.to_string()))?;
        info!(identity = identity.as_str(), fields = opened.len(), "submission processed");
        Ok(Response::Processed { success: value })
    }

    fn session_key(&self, session: &SessionId, identity: &str) -> Result<Arc<KeyPairRecord>> {
        self.vault
            .get(session, identity, DEFAULT_LABEL)
            .ok_or_else(|| Error::BadRequest("no session key for this client".to_string()))
    }

    fn default_certificate(&self, session: &SessionId, identity: &str) -> Result<Arc<CertificateRecord>> {
        Ok(self
            .vault
            .certificate_or_create(session, identity, DEFAULT_LABEL, |kp| {
                self.authority.issue(kp)
            })?)
    }

    fn trusted_certificates(&self, session: &SessionId, identity: &str) -> Result<Vec<X509>> {
        let mut trusted = Vec::new();
        for label in self.vault.labels(session, identity) {
            if let Some(cert) = self.vault.certificate(session, identity, &label) {
                trusted.push(cert.x509()?);
            }
        }
        Ok(trusted)
    }

    fn decrypt_text(&self, key: &KeyPairRecord, body: &ParsedBody, name: &str) -> Result<Option<String>> {
        let Some(field) = body.field(name) else {
            return Ok(None);
        };
        let bytes = self.cipher.decrypt_from_transport(field, key.private_key())?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| Error::Crypto(CryptoError::InvalidUtf8))
    }

    fn require_text(&self, key: &KeyPairRecord, body: &ParsedBody, name: &str) -> Result<String> {
        self.decrypt_text(key, body, name)?
            .ok_or_else(|| Error::BadRequest(format!("missing '{}' field", name)))
    }

    fn open_fields(&self, key: &KeyPairRecord, body: &ParsedBody) -> Result<Vec<(String, PlainField)>> {
        body.fields
            .iter()
            .map(|(name, field)| -> Result<(String, PlainField)> {
                Ok((name.clone(), self.cipher.open(field, key.private_key())?))
            })
            .collect()
    }

    /// The `message` field when present, else one `name: value` line per field.
    fn message_or_fields(&self, key: &KeyPairRecord, body: &ParsedBody) -> Result<String> {
        if let Some(message) = self.decrypt_text(key, body, MESSAGE_FIELD)? {
            return Ok(message);
        }
        let lines = self
            .open_fields(key, body)?
            .into_iter()
            .map(|(name, value)| match value.as_text() {
                Some(text) => format!("{}: {}", name, text),
                None => format!("{}: {}", name, value.to_json()),
            })
            .collect::<Vec<_>>();
        Ok(lines.join("\n"))
    }

    fn reject(&self, request: &InboundRequest, err: Error) -> GatewayResponse {
        let (status, message) = match &err {
            Error::Integrity(_) => (StatusCode::FORBIDDEN, "request failed integrity checks"),
            Error::Identity(_) => (StatusCode::BAD_REQUEST, "client address unavailable"),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "malformed request"),
            Error::Crypto(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "encrypted submission could not be processed",
            ),
            Error::Processing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "submission processing failed"),
        };
        warn!(status = status.as_u16(), "request rejected: {}", err);
        let details = self.debug.then(|| self.details(request, &err));
        GatewayResponse {
            status,
            body: Response::error(message, details),
        }
    }

    fn details(&self, request: &InboundRequest, err: &Error) -> Value {
        let address = self
            .resolver
            .resolve(&request.headers, request.peer.as_deref())
            .map(|identity| identity.address)
            .ok();
        let headers: Map<String, Value> = request
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(value.to_str().unwrap_or("<binary>").to_string()),
                )
            })
            .collect();
        json!({
            "reason": err.to_string(),
            "address": address,
            "headers": headers,
            "body": canonical_body(
                request.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                "",
            ),
        })
    }
}
