//! One form's submission flow.
//!
//! ```text
//! Idle -> KeyReady -> Encrypting -> Sending -> Success | Failure
//! ```
//!
//! The public key is fetched (or read from the cache) before anything is
//! encrypted. Failures are reported once through the error callback and never
//! retried. With caching disabled the cache entry is evicted after a success.

use openssl::pkey::{PKey, Public};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunked_cipher::{public_key_from_pem, ChunkedCipher};
use crate::configs::{AppConfig, IntegrityConfig};
use crate::error::ClientError;
use crate::integrity::integrity_headers;
use crate::protocol::{self, Operation, CERT_FIELD, EMAIL_FIELD, OPERATION_FIELD, PIN_FIELD};

use super::key_cache::ClientKeyCache;
use super::transport::{Transport, TransportResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    KeyReady,
    Encrypting,
    Sending,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub integrity: IntegrityConfig,
    pub cipher: ChunkedCipher,
    /// Keep the key cache between submissions.
    pub cache_keys: bool,
}

impl ClientConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            integrity: config.integrity.clone(),
            cipher: ChunkedCipher::new(config.keys.chunk_size, config.keys.padding),
            cache_keys: true,
        }
    }

    pub fn cache_keys(mut self, enabled: bool) -> Self {
        self.cache_keys = enabled;
        self
    }
}

type SuccessCallback = Box<dyn FnMut(&Value) + Send>;
type ErrorCallback = Box<dyn FnMut(&ClientError) + Send>;

pub struct SubmissionOrchestrator<T: Transport> {
    transport: T,
    cache: ClientKeyCache,
    config: ClientConfig,
    state: SubmissionState,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl<T: Transport> SubmissionOrchestrator<T> {
    pub fn new(transport: T, cache: ClientKeyCache, config: ClientConfig) -> Self {
        Self {
            transport,
            cache,
            config,
            state: SubmissionState::Idle,
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ClientError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    pub fn cache(&self) -> &ClientKeyCache {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cached public key, or a freshly fetched one when missing or forced.
    pub async fn public_key(&mut self, force: bool) -> Result<PKey<Public>, ClientError> {
        if !force {
            if let Some(pem) = self.cache.public_key() {
                debug!(backend = self.cache.backend_name(), "public key cache hit");
                return Ok(public_key_from_pem(&pem)?);
            }
        }
        let (uuid, iv) = self.cache.pseudonym()?;
        let body = self.send(protocol::public_key_request(&uuid, &iv)).await?;
        let pem = body
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::UnexpectedResponse("response has no key".to_string()))?;
        let key = public_key_from_pem(pem)?;
        self.cache.store_public_key(pem)?;
        info!("public key fetched and cached");
        Ok(key)
    }

    /// Encrypt every non-empty field and post them as one request.
    pub async fn submit(&mut self, fields: &[(&str, &str)]) -> Result<Value, ClientError> {
        let result = self.run(Vec::new(), fields).await;
        self.finish(result)
    }

    /// Run a PKCS#7 operation over the encrypted fields.
    pub async fn operation(
        &mut self,
        operation: Operation,
        fields: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let control = vec![(OPERATION_FIELD.to_string(), operation.as_str().to_string())];
        let result = self.run(control, fields).await;
        self.finish(result)
    }

    /// Request the certificate for the keyring slot named by `email`,
    /// protected by `pin`. The base64 certificate is cached.
    pub async fn certificate(
        &mut self,
        email: Option<&str>,
        pin: Option<&str>,
    ) -> Result<String, ClientError> {
        let control = vec![(CERT_FIELD.to_string(), "true".to_string())];
        let mut fields = Vec::new();
        if let Some(email) = email {
            fields.push((EMAIL_FIELD, email));
        }
        if let Some(pin) = pin {
            fields.push((PIN_FIELD, pin));
        }
        let result = self.run(control, &fields).await.and_then(|body| {
            body.get("certificate")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ClientError::UnexpectedResponse("response has no certificate".to_string())
                })
        });
        let certificate = match result {
            Ok(certificate) => certificate,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.cache.store_certificate(&certificate) {
            return Err(self.fail(e));
        }
        self.succeed(&Value::String(certificate.clone()))?;
        Ok(certificate)
    }

    /// Prove possession of the PIN for the latest keyring bundle.
    pub async fn authenticate(&mut self, pin: &str) -> Result<bool, ClientError> {
        let mut control = vec![(
            OPERATION_FIELD.to_string(),
            Operation::Authenticate.as_str().to_string(),
        )];
        if let Some(certificate) = self.cache.certificate() {
            control.push((CERT_FIELD.to_string(), certificate));
        }
        let result = self.run(control, &[(PIN_FIELD, pin)]).await;
        let body = self.finish(result)?;
        Ok(body.get("Authenticate").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn run(
        &mut self,
        control: Vec<(String, String)>,
        fields: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        self.state = SubmissionState::Idle;
        let key = self.public_key(false).await?;
        self.state = SubmissionState::KeyReady;

        self.state = SubmissionState::Encrypting;
        let mut pairs = control;
        for (name, value) in fields.iter().filter(|(_, value)| !value.is_empty()) {
            let encrypted = self.config.cipher.encrypt_for_transport(value.as_bytes(), &key)?;
            pairs.extend(encrypted.to_form_pairs(name));
        }

        self.state = SubmissionState::Sending;
        self.send(pairs).await
    }

    async fn send(&self, fields: Vec<(String, String)>) -> Result<Value, ClientError> {
        let headers = integrity_headers(
            &self.config.integrity,
            &self.config.integrity.app_token,
            &fields,
        )?;
        let TransportResponse { status, body } = self.transport.post(headers, fields).await?;
        if let Some(message) = body.get("error") {
            return Err(ClientError::Server {
                message: message.as_str().unwrap_or("error").to_string(),
                details: body.get("details").cloned(),
            });
        }
        if !(200..300).contains(&status) {
            return Err(ClientError::UnexpectedResponse(format!("status {}", status)));
        }
        Ok(body)
    }

    fn finish(&mut self, result: Result<Value, ClientError>) -> Result<Value, ClientError> {
        match result {
            Ok(body) => {
                self.succeed(&body)?;
                Ok(body)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // Evict before reporting success; a failed eviction fails the submission.
    fn succeed(&mut self, body: &Value) -> Result<(), ClientError> {
        if !self.config.cache_keys {
            if let Err(e) = self.cache.clear() {
                return Err(self.fail(e.into()));
            }
            debug!("key cache evicted after submission");
        }
        self.state = SubmissionState::Success;
        if let Some(callback) = self.on_success.as_mut() {
            callback(body);
        }
        if !self.config.cache_keys {
            self.state = SubmissionState::Idle;
        }
        Ok(())
    }

    fn fail(&mut self, error: ClientError) -> ClientError {
        self.state = SubmissionState::Failure;
        warn!("submission failed: {}", error);
        if let Some(callback) = self.on_error.as_mut() {
            callback(&error);
        }
        error
    }
}
