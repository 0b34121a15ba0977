use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use formseal::chunked_cipher::PlainField;
use formseal::client::{
    ClientConfig, ClientKeyCache, LoopbackTransport, StorageKind, SubmissionOrchestrator,
    SubmissionState, Transport, TransportResponse,
};
use formseal::client::key_cache::CacheBackend;
use formseal::configs::{AppConfig, KeyConfig};
use formseal::error::{ClientError, StorageError};
use formseal::gateway::{FormProcessor, Gateway};
use formseal::identity::ClientIdentity;
use formseal::protocol::Operation;
use formseal::session::MemorySessionStore;

const PEER: &str = "198.51.100.9";

fn config() -> AppConfig {
    AppConfig {
        keys: KeyConfig {
            rsa_bits: 1024,
            ..KeyConfig::default()
        },
        ..AppConfig::default()
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(String, PlainField)>>);

impl FormProcessor for Recorder {
    fn process(
        &self,
        _: &ClientIdentity,
        fields: &[(String, PlainField)],
    ) -> anyhow::Result<Value> {
        self.0.lock().extend(fields.iter().cloned());
        Ok(json!({ "received": fields.len() }))
    }
}

/// Counts posts passing through to the wrapped transport.
struct Counting<T> {
    inner: T,
    posts: Arc<AtomicUsize>,
}

#[async_trait]
impl<T: Transport> Transport for Counting<T> {
    async fn post(
        &self,
        headers: Vec<(String, String)>,
        fields: Vec<(String, String)>,
    ) -> Result<TransportResponse, ClientError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.inner.post(headers, fields).await
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    recorder: Arc<Recorder>,
    posts: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let recorder = Arc::new(Recorder::default());
        let gateway = Arc::new(
            Gateway::new(&config(), Arc::new(MemorySessionStore::new()))
                .with_processor(recorder.clone()),
        );
        Self {
            gateway,
            recorder,
            posts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn client(&self, client_config: ClientConfig) -> SubmissionOrchestrator<Counting<LoopbackTransport>> {
        self.client_with_cache(client_config, ClientKeyCache::new(&StorageKind::Session))
    }

    fn client_with_cache(
        &self,
        client_config: ClientConfig,
        cache: ClientKeyCache,
    ) -> SubmissionOrchestrator<Counting<LoopbackTransport>> {
        let transport = Counting {
            inner: LoopbackTransport::new(Arc::clone(&self.gateway), PEER),
            posts: Arc::clone(&self.posts),
        };
        SubmissionOrchestrator::new(transport, cache, client_config)
    }

    fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_long_field_reconstructed_exactly() {
    let harness = Harness::new();
    let mut form = harness.client(ClientConfig::from_app(&config()));

    let message = "A".repeat(200);
    let response = form
        .submit(&[("message", message.as_str()), ("empty", "")])
        .await
        .unwrap();
    assert_eq!(response, json!({ "success": { "received": 1 } }));
    assert_eq!(form.state(), SubmissionState::Success);

    let recorded = harness.recorder.0.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "message");
    assert_eq!(recorded[0].1.as_text(), Some(message.as_str()));
}

#[tokio::test]
async fn test_cached_key_is_reused() {
    let harness = Harness::new();
    let mut form = harness.client(ClientConfig::from_app(&config()));

    form.submit(&[("name", "John")]).await.unwrap();
    form.submit(&[("name", "Jane")]).await.unwrap();
    // one key fetch, two submissions
    assert_eq!(harness.posts(), 3);
    assert!(form.cache().public_key().is_some());
    assert_eq!(harness.gateway.vault().generated_count(), 1);
}

#[tokio::test]
async fn test_disabled_cache_evicts_without_rotating_server_key() {
    let harness = Harness::new();
    let mut form = harness.client(ClientConfig::from_app(&config()).cache_keys(false));

    form.submit(&[("name", "John")]).await.unwrap();
    assert_eq!(form.state(), SubmissionState::Idle);
    assert!(form.cache().public_key().is_none());

    form.submit(&[("name", "Jane")]).await.unwrap();
    assert_eq!(harness.posts(), 4);
    assert_eq!(harness.gateway.vault().generated_count(), 1);
}

/// Accepts writes but cannot remove anything it holds.
#[derive(Default)]
struct StickyStorage(HashMap<String, String>);

impl CacheBackend for StickyStorage {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.0.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        if self.0.contains_key(key) {
            return Err(StorageError::Unavailable("sticky"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_eviction_is_reported_as_failure() {
    let harness = Harness::new();
    let successes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (ok, err) = (Arc::clone(&successes), Arc::clone(&errors));
    let mut form = harness
        .client_with_cache(
            ClientConfig::from_app(&config()).cache_keys(false),
            ClientKeyCache::with_backend(Box::new(StickyStorage::default())),
        )
        .on_success(move |_| {
            ok.fetch_add(1, Ordering::SeqCst);
        })
        .on_error(move |_| {
            err.fetch_add(1, Ordering::SeqCst);
        });

    let result = form.submit(&[("name", "John")]).await;
    assert!(matches!(result, Err(ClientError::Storage(_))));
    assert_eq!(form.state(), SubmissionState::Failure);
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    // the submission itself reached the server
    assert_eq!(harness.recorder.0.lock().len(), 1);
}

#[tokio::test]
async fn test_integrity_failure_reaches_error_callback() {
    let harness = Harness::new();
    let mut client_config = ClientConfig::from_app(&config());
    client_config.integrity.app_token = "guessed".to_string();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut form = harness
        .client(client_config)
        .on_error(move |e| sink.lock().push(e.to_string()))
        .on_success(|_| panic!("must not succeed"));

    let err = form.submit(&[("name", "John")]).await.unwrap_err();
    assert!(matches!(err, ClientError::Server { details: None, .. }));
    assert_eq!(form.state(), SubmissionState::Failure);
    assert_eq!(seen.lock().len(), 1);
    // no retry, no key generated
    assert_eq!(harness.posts(), 1);
    assert_eq!(harness.gateway.vault().generated_count(), 0);
}

#[tokio::test]
async fn test_authenticate_with_correct_and_wrong_pin() {
    let harness = Harness::new();
    let mut form = harness.client(ClientConfig::from_app(&config()));

    let certificate = form
        .certificate(Some("alice@example.com"), Some("2468"))
        .await
        .unwrap();
    assert_eq!(form.cache().certificate().as_deref(), Some(certificate.as_str()));

    assert!(form.authenticate("2468").await.unwrap());
    assert!(!form.authenticate("1357").await.unwrap());
    assert_eq!(form.state(), SubmissionState::Success);
}

#[tokio::test]
async fn test_sign_and_verify_through_client() {
    let harness = Harness::new();
    let mut form = harness.client(ClientConfig::from_app(&config()));

    let signed = form
        .operation(Operation::Sign, &[("name", "John"), ("email", "a@b.com")])
        .await
        .unwrap();
    let signed = signed["signed"].as_str().unwrap().to_string();

    let verified = form
        .operation(Operation::Verify, &[("message", signed.as_str())])
        .await
        .unwrap();
    assert_eq!(verified, json!({ "verified": true }));
}
