//! HTTP ingestion endpoint.
//!
//! `ANY /<prefix>/<topic>/<hash>[.ok]` authenticates the tenant with the two
//! trusted headers set upstream, stores the whole request as a job and
//! publishes it for dispatch. `GET <health_path>` reports per-topic queue
//! statistics.

mod auth;
mod error;
mod path;
mod request;

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use axum::{Json, Router};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::IngestConfig;
use crate::dispatch::{DispatchRegistry, Msg, TopicStats};
use crate::logging::{LogLevel, Logger};
use crate::shutdown::ShutdownSignal;
use crate::storage::{StorageFacade, topic_key};

use auth::verify_topic_signature;
use path::{ReplyMode, is_valid_name, parse_target};
use request::serialize_request;

pub use auth::topic_signature;
pub use error::IngestError;

const CONTEXT: &str = "ingest";

pub struct IngestState {
    pub storage: Arc<StorageFacade>,
    pub registry: Arc<DispatchRegistry>,
    pub logger: Logger,
    pub config: IngestConfig,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub topics: Vec<TopicStats>,
}

pub fn router(state: Arc<IngestState>) -> Router {
    let prefix = state.config.prefix.trim_matches('/').to_owned();
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        .route(&state.config.health_path, get(health))
        .route(&format!("/{prefix}/{{*target}}"), any(ingest_job))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn health(State(state): State<Arc<IngestState>>) -> Json<HealthReport> {
    Json(HealthReport {
        generated_at: Utc::now(),
        topics: state.registry.snapshot(),
    })
}

async fn ingest_job(
    State(state): State<Arc<IngestState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match accept_job(&state, &method, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(error) => {
            let level = if error.status_code().is_server_error() {
                LogLevel::Error
            } else {
                LogLevel::Warn
            };
            state.logger.log(
                level,
                Some(CONTEXT),
                &format!("Ingestion rejected: {error}"),
                Some(json!({
                    "method": method.as_str(),
                    "path": uri.path(),
                    "status": error.status_code().as_u16()
                })),
            );
            error.into_response()
        }
    }
}

async fn accept_job(
    state: &Arc<IngestState>,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, IngestError> {
    let prefix = state.config.prefix.trim_matches('/');
    let target = parse_target(prefix, uri.path())?;

    let secret = header_str(headers, &state.config.secret_header).ok_or(IngestError::QueueDisabled)?;
    let tenant = header_str(headers, &state.config.domain_header).ok_or(IngestError::MissingTenant)?;
    if !is_valid_name(tenant) {
        return Err(IngestError::InvalidTenant {
            tenant: tenant.to_owned(),
        });
    }
    if !verify_topic_signature(secret, &target.topic, &target.hash) {
        return Err(IngestError::InvalidHash);
    }

    let payload = serialize_request(method, uri, headers, body, &state.config.secret_header);
    let payload_bytes = payload.len();
    let msg = enqueue(Arc::clone(state), tenant.to_owned(), target.topic.clone(), payload).await?;

    state.logger.log(
        LogLevel::Debug,
        Some(CONTEXT),
        "Job ingested",
        Some(json!({
            "topic": msg.topic,
            "id": msg.id,
            "payload_bytes": payload_bytes
        })),
    );

    Ok(match target.reply {
        ReplyMode::Silent => StatusCode::OK.into_response(),
        ReplyMode::Ok => (StatusCode::OK, "OK").into_response(),
    })
}

/// Appends and publishes on the blocking pool; `publish` waits while the
/// topic's pending buffer is full.
async fn enqueue(
    state: Arc<IngestState>,
    tenant: String,
    topic: String,
    payload: Vec<u8>,
) -> Result<Msg, IngestError> {
    tokio::task::spawn_blocking(move || -> Result<Msg, IngestError> {
        let id = state
            .storage
            .append(&tenant, &topic, &payload)
            .map_err(IngestError::Storage)?;
        let msg = Msg::new(topic_key(&tenant, &topic), id);
        state.registry.ensure_topic(&msg.topic);
        state
            .registry
            .publish(msg.clone())
            .map_err(IngestError::Registry)?;
        Ok(msg)
    })
    .await
    .map_err(|error| IngestError::Internal(error.to_string()))?
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub async fn serve(
    listener: StdTcpListener,
    router: Router,
    signal: ShutdownSignal,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(listener, router)
        .with_graceful_shutdown(signal.wait())
        .await
}

/// Runs the HTTP endpoint on its own tokio runtime thread until `signal`
/// fires and in-flight requests finish.
pub fn spawn_http_server(
    listener: StdTcpListener,
    state: Arc<IngestState>,
    signal: ShutdownSignal,
) -> io::Result<JoinHandle<io::Result<()>>> {
    thread::Builder::new()
        .name("ingest-http".to_owned())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("ingest-worker")
                .enable_all()
                .build()?;
            runtime.block_on(serve(listener, router(state), signal))
        })
}
