use crate::config::ApiConfig;
use crate::derivative::{DerivativeCache, DerivativeError};
use crate::multipart::{DecodeOutcome, DecoderSettings, MultipartDecoder};
use crate::store::{Store, StoreError};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub derivatives: Arc<DerivativeCache>,
    pub decoder_settings: DecoderSettings,
}

/// Query parameters for blob retrieval
#[derive(Debug, Deserialize)]
pub struct GetQuery {
    /// Blob name
    pub path: String,
    /// Derivative width; the stored blob itself is served when absent
    pub size: Option<u32>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
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

    Router::new()
        .route("/get", get(get_blob))
        .route("/upload", post(upload))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::PRAGMA,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::EXPIRES,
            HeaderValue::from_static("0"),
        ))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "media-storage"
    }))
}

/// Serve a stored blob, or its derivative at `size` pixels wide
#[instrument(skip(state))]
async fn get_blob(
    State(state): State<AppState>,
    Query(params): Query<GetQuery>,
) -> Result<Response, ApiError> {
    let content_type = match params.size {
        Some(_) => "image/jpeg",
        None => content_type_for(&params.path),
    };

    let GetQuery { path, size } = params;
    let opened = tokio::task::spawn_blocking(move || match size {
        Some(width) => state.derivatives.get_derivative(&path, width),
        None => state.store.open_blob(&path).map(Some).map_err(DerivativeError::from),
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Blob task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "TASK_ERROR")
    })?
    .map_err(derivative_error)?;

    let body = match opened {
        Some(file) => file_body(file),
        // Empty source, nothing to derive
        None => Body::empty(),
    };

    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

fn file_body(file: File) -> Body {
    Body::from_stream(ReaderStream::new(tokio::fs::File::from_std(file)))
}

fn derivative_error(err: DerivativeError) -> ApiError {
    match &err {
        DerivativeError::Store(StoreError::NotFound(_)) => {
            api_error(StatusCode::NOT_FOUND, err.to_string(), "NOT_FOUND")
        }
        DerivativeError::Store(StoreError::InvalidName(_)) => {
            api_error(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_NAME")
        }
        DerivativeError::InvalidWidth { .. } | DerivativeError::TooManyPixels { .. } => {
            api_error(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_SIZE")
        }
        _ => {
            error!(error = %err, "Failed to serve blob");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), "GET_ERROR")
        }
    }
}

/// Store every part of a multipart body, returning the stored names
#[instrument(skip(state, headers, body))]
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Vec<String>>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Missing Content-Type header",
                "MISSING_CONTENT_TYPE",
            )
        })?;

    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let reader = SyncIoBridge::new(StreamReader::new(stream));

    let outcome = tokio::task::spawn_blocking(move || {
        MultipartDecoder::new(&state.store, state.decoder_settings).decode(&content_type, reader)
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Upload task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "TASK_ERROR")
    })?;

    match outcome {
        DecodeOutcome::Completed(names) => {
            metrics::counter!("media.uploads.completed").increment(1);
            Ok(Json(names))
        }
        failure => {
            metrics::counter!("media.uploads.failed").increment(1);
            warn!(code = failure.code(), "Upload rejected");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                failure.detail().unwrap_or_default(),
                failure.code(),
            ))
        }
    }
}

/// Content type for a blob name, by extension
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Start the upload/retrieval API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting media API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
