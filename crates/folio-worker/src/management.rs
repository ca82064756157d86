//! Management endpoint
//!
//! Small HTTP surface for operators: `GET /health` is open, `GET /queues` and
//! `GET /dead-letters` require HTTP Basic auth with the broker admin credentials.

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use folio_infra::ErrorResponse;

use crate::dead_letter::DeadLetterRecord;
use crate::manager::QueueRuntime;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AdminCredentials {
    user: String,
    password: String,
}

impl AdminCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn matches(&self, user: &str, password: &str) -> bool {
        // Non-short-circuiting: both fields are always compared.
        secure_compare(user, &self.user) & secure_compare(password, &self.password)
    }
}

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// `user:password` from a `Basic` authorization header.
fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[derive(Clone)]
pub struct ManagementState {
    runtime: Arc<QueueRuntime>,
    credentials: Arc<AdminCredentials>,
}

impl ManagementState {
    pub fn new(runtime: Arc<QueueRuntime>, credentials: AdminCredentials) -> Self {
        Self {
            runtime,
            credentials: Arc::new(credentials),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
}

#[derive(Serialize)]
struct DeadLettersResponse {
    total: u64,
    records: Vec<DeadLetterRecord>,
}

pub fn router(state: ManagementState) -> Router {
    let protected = Router::new()
        .route("/queues", get(queues))
        .route("/dead-letters", get(dead_letters))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn require_admin(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_basic_auth)
        .map(|(user, password)| state.credentials.matches(&user, &password))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected management request");
        let mut response =
            ErrorResponse::new(StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"folio\""),
        );
        return response;
    }

    next.run(request).await
}

async fn health(State(state): State<ManagementState>) -> impl IntoResponse {
    let running = state.runtime.is_running();
    let (code, status) = if running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    };
    (code, Json(HealthResponse { status, running }))
}

async fn queues(State(state): State<ManagementState>) -> Response {
    match state.runtime.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => ErrorResponse::new(StatusCode::SERVICE_UNAVAILABLE, "Queue statistics unavailable")
            .with_details(e.to_string())
            .with_error_type(e.error_code())
            .into_response(),
    }
}

async fn dead_letters(State(state): State<ManagementState>) -> Json<DeadLettersResponse> {
    let log = state.runtime.dead_letter_log();
    Json(DeadLettersResponse {
        total: log.total(),
        records: log.records().await,
    })
}

/// Management endpoint served from a background task.
pub struct ManagementServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ManagementServer {
    pub async fn bind(addr: &str, state: ManagementState) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let app = router(state);
        let join = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "Management endpoint failed");
            }
        });

        tracing::info!(addr = %local_addr, "Management endpoint listening");
        Ok(Self {
            local_addr,
            cancel,
            join,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.join).await.is_err() {
            tracing::warn!(addr = %self.local_addr, "Management endpoint did not stop in time");
        } else {
            tracing::info!(addr = %self.local_addr, "Management endpoint stopped");
        }
    }
}
