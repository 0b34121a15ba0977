//! How the client reaches the submission endpoint.

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ClientError;
use crate::gateway::{Gateway, InboundRequest};
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// One form POST with extra headers. No retries, no timeout of its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        headers: Vec<(String, String)>,
        fields: Vec<(String, String)>,
    ) -> Result<TransportResponse, ClientError>;
}

/// HTTP transport keeping the session cookie between calls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        headers: Vec<(String, String)>,
        fields: Vec<(String, String)>,
    ) -> Result<TransportResponse, ClientError> {
        let mut request = self.client.post(&self.url).form(&fields);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ClientError::UnexpectedResponse(format!("status {}: {}", status, e)))?;
        Ok(TransportResponse { status, body })
    }
}

/// In-process transport calling a [`Gateway`] directly.
///
/// Plays the role of the cookie jar: the first accepted call opens a session
/// and later calls reuse it.
pub struct LoopbackTransport {
    gateway: Arc<Gateway>,
    peer: String,
    session: Mutex<Option<SessionId>>,
}

impl LoopbackTransport {
    pub fn new(gateway: Arc<Gateway>, peer: impl Into<String>) -> Self {
        Self {
            gateway,
            peer: peer.into(),
            session: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn post(
        &self,
        headers: Vec<(String, String)>,
        fields: Vec<(String, String)>,
    ) -> Result<TransportResponse, ClientError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Network(format!("bad header name: {}", e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ClientError::Network(format!("bad header value: {}", e)))?;
            map.insert(name, value);
        }
        let existing = self.session();
        let session = self
            .gateway
            .open_session(existing.as_ref().map(|s| s.as_str()));
        let request = InboundRequest {
            session: session.clone(),
            peer: Some(self.peer.clone()),
            headers: map,
            fields,
        };
        let gateway = Arc::clone(&self.gateway);
        let response = tokio::task::spawn_blocking(move || gateway.handle(&request))
            .await
            .map_err(|e| ClientError::Network(format!("loopback worker failed: {}", e)))?;
        if self.gateway.has_session(&session) {
            *self.session.lock() = Some(session);
        }
        Ok(TransportResponse {
            status: response.status.as_u16(),
            body: response.to_json(),
        })
    }
}
