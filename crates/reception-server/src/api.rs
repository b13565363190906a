use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ReceptionError;
use crate::intake::{FileDescriptor, StreamCipherIntake};
use crate::message::{self, CallerMetadata};
use crate::promoter::{BatchPromoter, BatchSession};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::shutdown::Shutdown;
use crate::submitter::MessageSubmitter;

const FIELD_MESSAGE: &str = "message";
const FIELD_FILES: &str = "files[]";

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<StreamCipherIntake>,
    pub promoter: Arc<BatchPromoter>,
    pub submitter: Arc<MessageSubmitter>,
    pub rate_limiter: RateLimiter,
    pub max_body_size: usize,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/message", post(post_message))
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /message`, either a bare JSON message or a multipart form with a
/// `message` part and any number of `files[]` parts.
async fn post_message(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ReceptionError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let metadata = caller_metadata(request.headers());

    if content_type.starts_with("application/json") {
        let body = Bytes::from_request(request, &state)
            .await
            .map_err(|e| ReceptionError::BadRequest(e.body_text()))?;
        let raw: Value = serde_json::from_slice(&body)
            .map_err(|e| ReceptionError::BadRequest(format!("Invalid JSON: {e}")))?;

        let message = message::parse(raw)?;
        let outcome = state
            .submitter
            .submit(&message, Some(metadata), Vec::new())
            .await?;
        return Ok(outcome.into_response());
    }

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ReceptionError::BadRequest(e.body_text()))?;
        return post_multipart(&state, multipart, metadata).await;
    }

    Err(ReceptionError::UnsupportedContentType(content_type))
}

async fn post_multipart(
    state: &AppState,
    mut multipart: Multipart,
    metadata: CallerMetadata,
) -> Result<Response, ReceptionError> {
    // Any early return drops the session, which discards what was staged.
    let session = BatchSession::open(state.promoter.clone());
    let mut raw_message: Option<Value> = None;
    let mut files: Vec<FileDescriptor> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ReceptionError::BadRequest(e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(FIELD_MESSAGE) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ReceptionError::BadRequest(e.body_text()))?;
                let value = serde_json::from_str(&text)
                    .map_err(|e| ReceptionError::BadRequest(format!("Invalid message part: {e}")))?;
                raw_message = Some(value);
            }
            Some(FIELD_FILES) => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let mimetype = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if !state.intake.keys_available() {
                    warn!(batch = %session.id(), "File part refused, no encryption certificate loaded yet");
                    return Err(ReceptionError::NoEncryptionKeys);
                }
                debug!(batch = %session.id(), %filename, %mimetype, "Receiving file part");

                // The keyring may be pruned empty while the part streams.
                let artifact = state
                    .intake
                    .receive_file(session.id(), &filename, &mimetype, field)
                    .await
                    .map_err(|e| match e {
                        ReceptionError::NoRecipients => ReceptionError::NoEncryptionKeys,
                        other => other,
                    })?;
                files.push(artifact.descriptor);
            }
            other => {
                return Err(ReceptionError::BadRequest(format!(
                    "Unexpected multipart field: {}",
                    other.unwrap_or("<unnamed>")
                )));
            }
        }
    }

    let raw_message = raw_message
        .ok_or_else(|| ReceptionError::BadRequest("Missing message part".to_string()))?;
    let message = message::parse(raw_message)?;

    info!(batch = %session.id(), files = files.len(), "Multipart message received");
    let outcome = state
        .submitter
        .submit_with_batch(&message, Some(metadata), session, files)
        .await?;
    Ok(outcome.into_response())
}

fn caller_metadata(headers: &HeaderMap) -> CallerMetadata {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    CallerMetadata {
        user_agent: read("user-agent"),
        origin: read("origin"),
        forwarded_for: read("x-forwarded-for"),
        real_ip: read("x-real-ip"),
    }
}

/// Start the HTTP server and run until `shutdown` fires.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.triggered().await })
    .await?;

    Ok(())
}
