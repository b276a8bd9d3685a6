use crate::credential_issuer::{CredentialIssuer, IssueError, UploadCredential};
use crate::upload_policy::{validate_batch, PolicyViolation, UploadDescriptor, MAX_FILES_PER_BATCH};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Path of the upload URL endpoint
pub const PRESIGNED_URL_PATH: &str = "/api/presigned-url";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub issuer: Arc<CredentialIssuer>,
    /// Value sent in `Access-Control-Allow-Origin`
    pub allowed_origin: String,
}

impl AppState {
    pub fn new(issuer: Arc<CredentialIssuer>, config: &ApiConfig) -> Self {
        Self {
            issuer,
            allowed_origin: config
                .allowed_origin
                .clone()
                .unwrap_or_else(|| "*".to_string()),
        }
    }
}

/// Successful response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlsResponse {
    pub success: bool,
    pub presigned_urls: Vec<UploadCredential>,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Request failures, split by who caused them
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed batch or policy violation; never retried
    #[error("{0}")]
    BadRequest(String),

    /// Configuration or unexpected failure; details stay in the logs
    #[error("{0}")]
    Internal(String),
}

impl From<PolicyViolation> for ApiError {
    fn from(violation: PolicyViolation) -> Self {
        ApiError::BadRequest(violation.to_string())
    }
}

impl From<IssueError> for ApiError {
    fn from(e: IssueError) -> Self {
        error!(error = %e, "Failed to issue upload credentials");
        ApiError::Internal("Failed to generate upload URLs".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = match &self {
            ApiError::BadRequest(message) => {
                warn!(message = %message, "Rejected upload URL request");
                metrics::counter!("presign.requests.rejected").increment(1);
                (StatusCode::BAD_REQUEST, "Bad request")
            }
            ApiError::Internal(_) => {
                metrics::counter!("presign.requests.failed").increment(1);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = ErrorResponse {
            error: label.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Result<Router> {
    let allow_origin = if state.allowed_origin == "*" {
        AllowOrigin::any()
    } else {
        let origin: HeaderValue = state
            .allowed_origin
            .parse()
            .context("Invalid allowed origin")?;
        AllowOrigin::exact(origin)
    };

    // Answers every OPTIONS request itself, so no handler is routed for it
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let router = Router::new()
        .route("/health", get(health_check))
        .route(
            PRESIGNED_URL_PATH,
            post(request_upload_urls).fallback(method_not_allowed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    Ok(router)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "rfq-presign"
    }))
}

/// JSON 405 for anything but POST on the upload endpoint
async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(ErrorResponse {
            error: "Method not allowed".to_string(),
            message: "Only POST requests are accepted".to_string(),
        }),
    )
}

/// Issue one presigned upload URL per requested file
#[instrument(skip(state, body), fields(body_len = body.len()))]
async fn request_upload_urls(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PresignedUrlsResponse>, ApiError> {
    let descriptors = parse_descriptors(&body)?;

    validate_batch(&descriptors)?;

    let presigned_urls = state.issuer.issue_batch(&descriptors).await?;

    info!(files = presigned_urls.len(), "Issued upload URLs");
    metrics::counter!("presign.requests.accepted").increment(1);

    Ok(Json(PresignedUrlsResponse {
        success: true,
        presigned_urls,
    }))
}

/// Turn a raw request body into descriptors, reporting shape problems
/// with stable messages instead of serde's
fn parse_descriptors(body: &[u8]) -> Result<Vec<UploadDescriptor>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("Request body is required".to_string()));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::BadRequest("Request body must be valid JSON".to_string()))?;

    let files = match value.get("files").and_then(Value::as_array) {
        Some(files) if !files.is_empty() => files,
        _ => return Err(PolicyViolation::EmptyBatch.into()),
    };

    if files.len() > MAX_FILES_PER_BATCH {
        return Err(PolicyViolation::TooManyFiles { count: files.len() }.into());
    }

    files.iter().map(parse_descriptor).collect()
}

fn parse_descriptor(file: &Value) -> Result<UploadDescriptor, ApiError> {
    let non_empty = |field: &str| {
        file.get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (
        non_empty("fileName"),
        non_empty("fileType"),
        file.get("fileSize").and_then(file_size),
    ) {
        (Some(file_name), Some(file_type), Some(file_size)) => Ok(UploadDescriptor {
            file_name,
            file_type,
            file_size,
        }),
        _ => Err(ApiError::BadRequest(
            "Each file must have fileName, fileType, and fileSize".to_string(),
        )),
    }
}

// Any JSON number holding a whole, non-negative value
fn file_size(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

/// Start the presigned URL API server
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state)?;
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting presigned URL API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
