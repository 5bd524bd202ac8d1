use crate::config::ApiConfig;
use crate::error::{ErrorResponse, IntakeError};
use crate::object_store::StorageError;
use crate::orchestrator::{CallbackOutcome, Orchestrator};
use crate::product::{Product, ProductId};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const FILE_NAME_HEADER: &str = "x-file-name";
/// Required on uploads; any `1` or `1.x` value is served
const ACCEPT_VERSION_HEADER: &str = "accept-version";
const SUPPORTED_MAJOR_VERSION: &str = "1";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Ingest acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub id: ProductId,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Keyword to match against indexed metadata
    pub q: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub ids: Vec<ProductId>,
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // uploads stream past this limit; it only bounds buffered bodies
    let body_limit = DefaultBodyLimit::max(config.max_buffered_body_bytes);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ingest", post(ingest))
        .route("/store/:id", post(store_callback))
        .route("/retrieve/:id", get(retrieve))
        .route("/search", get(search))
        .route("/products/:id", get(product))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "intake-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "ledger": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "ledger": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept an upload into quarantine, streaming the body through to storage
#[instrument(skip(state, headers, body))]
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<IngestResponse>), IntakeError> {
    let version = header_value(&headers, ACCEPT_VERSION_HEADER)
        .ok_or_else(|| IntakeError::Validation("missing Accept-Version header".to_string()))?;
    if !supported_version(version) {
        return Err(IntakeError::Validation(format!(
            "unsupported Accept-Version `{version}`; this service speaks version {SUPPORTED_MAJOR_VERSION}"
        )));
    }

    let size = header_value(&headers, header::CONTENT_LENGTH.as_str())
        .ok_or_else(|| IntakeError::Validation("missing Content-Length header".to_string()))?
        .parse::<u64>()
        .map_err(|_| IntakeError::Validation("Content-Length is not a number".to_string()))?;

    let file_name = header_value(&headers, FILE_NAME_HEADER)
        .ok_or_else(|| IntakeError::Validation("missing X-File-Name header".to_string()))?;

    let mime_type =
        header_value(&headers, header::CONTENT_TYPE.as_str()).unwrap_or(DEFAULT_CONTENT_TYPE);

    let body = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|e| StorageError::InvalidBody(e.to_string())))
        .boxed();
    let id = state
        .orchestrator
        .ingest(body, size, mime_type, file_name)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { id })))
}

/// Callback endpoint for the transform service
async fn store_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CallbackOutcome>, IntakeError> {
    let id = parse_id(&id)?;
    let outcome = state.orchestrator.handle_callback(id, &body).await?;
    Ok(Json(outcome))
}

/// Download a promoted product
#[instrument(skip(state))]
async fn retrieve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, IntakeError> {
    let id = parse_id(&id)?;
    let product = state.orchestrator.retrieve(id).await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        product.file_name.replace(['"', '\\', '\r', '\n'], "_")
    );
    let mut response = (
        [
            (header::CONTENT_TYPE, product.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(product.body),
    )
        .into_response();
    if let Some(size) = product.size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

/// Keyword search over promoted products
#[instrument(skip(state))]
async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, IntakeError> {
    let keyword = params.q.unwrap_or_default();
    let ids = state.orchestrator.search(&keyword).await?;
    Ok(Json(SearchResponse { ids }))
}

/// Ledger view of a product
async fn product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Product>, IntakeError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.product(id).await?))
}

fn parse_id(raw: &str) -> Result<ProductId, IntakeError> {
    raw.parse()
        .map_err(|_| IntakeError::Validation(format!("`{raw}` is not a product id")))
}

fn supported_version(version: &str) -> bool {
    version.split('.').next() == Some(SUPPORTED_MAJOR_VERSION)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Start the HTTP API; returns once `cancel` fires and in-flight requests finish
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting intake API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
