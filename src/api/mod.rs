//! HTTP ingestion API.
//!
//! `POST /sendsms` accepts `{"message": "<text>"}`, allocates a message id and
//! enqueues the text for delivery; the response carries the allocated id.
//! `GET /status` reports network registration and uptime. Both routes sit
//! behind HTTP basic auth checked against the configured credentials.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::logutil::escape_log;
use crate::modem::Modem;
use crate::state::State as GatewayState;
use crate::storage::Storage;

pub struct ApiContext {
    pub config: Arc<Config>,
    pub state: Arc<GatewayState>,
    pub storage: Arc<Storage>,
    pub modem: Arc<Modem>,
    pub started_at: DateTime<Utc>,
}

pub type SharedApi = Arc<ApiContext>;

#[derive(Deserialize)]
struct SendSmsRequest {
    message: String,
}

pub fn router(api: SharedApi) -> Router {
    Router::new()
        .route("/sendsms", post(send_sms))
        .route("/status", get(status))
        .layer(middleware::from_fn_with_state(
            api.clone(),
            require_basic_auth,
        ))
        .with_state(api)
}

/// Bind the listen socket. Failing to bind is a startup failure.
pub async fn bind(config: &Config) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.bind_ip, config.rest_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind REST API socket {}", addr))?;
    warn!("TLS NOT supported, running unencrypted");
    Ok(listener)
}

/// Serve until the shutdown signal flips; in-flight requests are drained by
/// the graceful shutdown (the caller enforces the drain deadline).
pub async fn serve(
    listener: TcpListener,
    api: SharedApi,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(api);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("REST API server failed")
}

fn authorized(user: &str, password: &str, headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    match text.split_once(':') {
        Some((u, p)) => u == user && p == password,
        None => false,
    }
}

async fn require_basic_auth(State(api): State<SharedApi>, req: Request, next: Next) -> Response {
    if authorized(
        &api.config.rest_user,
        &api.config.rest_password,
        req.headers(),
    ) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"sms-gateway\"")],
            "authorization required",
        )
            .into_response()
    }
}

async fn send_sms(State(api): State<SharedApi>, Json(req): Json<SendSmsRequest>) -> Response {
    debug!("Incoming HTTP request");
    info!(
        "Incoming HTTP request with message '{}'",
        escape_log(&req.message)
    );
    if req.message.trim().is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SMS text cannot be empty or blank",
        )
            .into_response();
    }

    let id = api.state.allocate_id();
    match api.storage.enqueue(id, &req.message) {
        Ok(_) => {
            // make the allocation durable so a crash cannot hand the id out again
            if let Err(e) = api.state.flush() {
                error!("{:#}", e);
            }
            (StatusCode::OK, Json(json!({ "id": id }))).into_response()
        }
        Err(e) => {
            api.state.discard_id(id);
            error!("Failed to store message for sending: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to store message for sending: {:#}", e),
            )
                .into_response()
        }
    }
}

async fn status(State(api): State<SharedApi>) -> Response {
    let modem = api.modem.clone();
    let network_status = match tokio::task::spawn_blocking(move || modem.connection_status()).await
    {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => {
            warn!("Status query failed: {:#}", e);
            "UNKNOWN".to_string()
        }
        Err(e) => {
            warn!("Status query panicked: {}", e);
            "UNKNOWN".to_string()
        }
    };
    Json(json!({
        "operational": true,
        "network_status": network_status,
        "startup_time": api.started_at.to_rfc3339(),
        "uptime_in_seconds": (Utc::now() - api.started_at).num_seconds(),
    }))
    .into_response()
}
