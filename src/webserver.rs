use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::services::fs::ServeDir;
use tracing::{error, info};

use crate::configs::{AppConfig, ServerConfig};
use crate::gateway::{Gateway, GatewayResponse, InboundRequest};
use crate::protocol;

pub const SESSION_COOKIE: &str = "formseal_sid";

/// Submission endpoint plus static files from `web_root`.
pub fn app(gateway: Arc<Gateway>, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.endpoint, post(submit))
        .fallback_service(ServeDir::new(&config.web_root))
        .with_state(gateway)
}

pub fn start_webserver(config: AppConfig, gateway: Arc<Gateway>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(serve(config, gateway))
}

/// Periodically end sessions that have gone idle.
pub fn spawn_session_sweeper(gateway: Arc<Gateway>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticks.tick().await;
            let swept = gateway.sweep_idle_sessions();
            if swept > 0 {
                info!(swept, "idle sessions ended");
            }
        }
    })
}

pub async fn serve(config: AppConfig, gateway: Arc<Gateway>) -> Result<()> {
    let server = &config.server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .context(format!("Invalid listen address {}:{}", server.host, server.port))?;
    let sweeper = spawn_session_sweeper(Arc::clone(&gateway), server.session_sweep());
    let app = app(gateway, server).into_make_service_with_connect_info::<SocketAddr>();

    match (&server.tls_cert_path, &server.tls_key_path) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("Failed to load TLS certificate and key")?;
            info!(
                %addr,
                endpoint = %server.endpoint,
                web_root = %server.web_root.display(),
                "HTTPS server ready"
            );
            axum_server::bind_rustls(addr, tls)
                .serve(app)
                .await
                .context("HTTPS server failed")?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context(format!("Failed to bind {}", addr))?;
            info!(
                %addr,
                endpoint = %server.endpoint,
                web_root = %server.web_root.display(),
                "HTTP server ready"
            );
            axum::serve(listener, app).await.context("HTTP server failed")?;
        }
    }
    sweeper.abort();
    Ok(())
}

async fn submit(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fields: Vec<(String, String)> = match serde_urlencoded::from_bytes(&body) {
        Ok(fields) => fields,
        Err(e) => {
            info!(%peer, "undecodable form body: {}", e);
            let body = protocol::Response::error("malformed request", None);
            return (StatusCode::BAD_REQUEST, Json(body.to_json())).into_response();
        }
    };

    let existing = cookie_value(&headers, SESSION_COOKIE);
    let session = gateway.open_session(existing.as_deref());
    let request = InboundRequest {
        session: session.clone(),
        peer: Some(peer.ip().to_string()),
        headers,
        fields,
    };

    let worker = Arc::clone(&gateway);
    let result = match tokio::task::spawn_blocking(move || worker.handle(&request)).await {
        Ok(result) => result,
        Err(e) => {
            error!("gateway worker failed: {}", e);
            GatewayResponse {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: protocol::Response::error("internal error", None),
            }
        }
    };

    let mut response = (result.status, Json(result.to_json())).into_response();
    // rejected requests never get a session, so there is nothing to point at
    if existing.as_deref() != Some(session.as_str()) && gateway.has_session(&session) {
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Strict",
            SESSION_COOKIE, session
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(SET_COOKIE, value);
        }
    }
    response
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
