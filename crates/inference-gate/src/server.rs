//! Axum HTTP server: proxy catch-all, introspection API, graceful shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use bytes::Bytes;
use gate_core::entry::StoredBody;
use gate_core::{
    Body as EntryBody, CanonicalRequest, Entry, GateBody, GateMode, GateResponse, Router,
    StoreError,
};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::GateConfig;

/// Largest client body the proxy will buffer for fingerprinting.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: GateConfig,
    pub router: Arc<Router>,
}

/// Build the axum application. Split from [`run`] so tests can drive it with
/// `tower::ServiceExt::oneshot`.
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/api/cache", get(handle_cache_list))
        .route("/api/cache/{id}", get(handle_cache_detail))
        .route("/api/stats", get(handle_stats))
        .route("/api/config", get(handle_config))
        .route("/health", get(handle_health))
        .fallback(handle_proxy)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Bind and serve until SIGINT.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = format!("{}:{}", state.config.host, state.config.port);
    let mode = state.router.mode();
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, mode = ?mode, "inference-gate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("inference-gate shut down gracefully");
    Ok(())
}

/// Catch-all proxy handler: every method and path goes through the router, so
/// model-list queries and health probes replay just like completions.
async fn handle_proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let query = parse_query(parts.uri.query());
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let canonical = CanonicalRequest::new(
        parts.method.as_str(),
        parts.uri.path(),
        query,
        headers,
        body,
    );

    into_axum(state.router.handle(canonical).await)
}

/// Translate the core's response into an axum one.
fn into_axum(response: GateResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));

    for (name, value) in &response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }

    let body = match response.body {
        GateBody::Full(bytes) => Body::from(bytes),
        GateBody::Stream(stream) => Body::from_stream(stream),
    };

    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    })
}

/// Decode `a=1&b=2` pairs, preserving arrival order for repeated names.
fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(name).decode_utf8_lossy().into_owned(),
                percent_decode_str(value).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

/// GET /api/cache — entry summaries.
async fn handle_cache_list(State(state): State<Arc<AppState>>) -> Response {
    match state.router.store().list().await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => storage_error(e),
    }
}

/// GET /api/cache/{id} — full entry detail.
async fn handle_cache_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let store = state.router.store();
    match store.get(&id).await {
        Ok(Some(entry)) => {
            let chunks = match store.read_chunks(&entry.response).await {
                Ok(chunks) => chunks,
                Err(e) => return storage_error(e),
            };
            Json(entry_detail(&entry, &chunks)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "id": id })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

/// GET /api/stats — aggregate store statistics.
async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.router.store().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => storage_error(e),
    }
}

/// GET /api/config — the running configuration, credentials excluded.
async fn handle_config(State(state): State<Arc<AppState>>) -> Response {
    let upstream_url = match state.router.mode() {
        GateMode::RecordAndReplay => Value::from(state.config.upstream.clone()),
        GateMode::ReplayOnly => Value::Null,
    };
    Json(json!({
        "mode": state.router.mode(),
        "upstream_url": upstream_url,
        "host": state.config.host,
        "port": state.config.port,
        "cache_dir": state.config.cache_dir,
    }))
    .into_response()
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Render an entry for the introspection API. Bodies decode to JSON where
/// possible; opaque payloads and SSE chunks render as (lossy) text.
pub fn entry_detail(entry: &Entry, chunks: &[Bytes]) -> Value {
    let request_body = decode_body(
        entry.meta.request.headers.get("content-type").map(String::as_str),
        &entry.request_body,
    );
    let response_body = match &entry.response {
        StoredBody::Full(bytes) => decode_body(
            entry
                .meta
                .response
                .headers
                .get("content-type")
                .map(String::as_str),
            bytes,
        ),
        StoredBody::Chunks { .. } => Value::Null,
    };
    let chunks: Vec<Value> = chunks
        .iter()
        .map(|c| Value::from(String::from_utf8_lossy(c).into_owned()))
        .collect();

    json!({
        "id": entry.meta.id,
        "created_at": entry.meta.created_at,
        "request": {
            "method": entry.meta.request.method,
            "path": entry.meta.request.path,
            "query": entry.meta.request.query,
            "headers": entry.meta.request.headers,
            "body": request_body,
        },
        "response": {
            "status_code": entry.meta.response.status_code,
            "headers": entry.meta.response.headers,
            "is_streaming": entry.meta.response.is_streaming,
            "body": response_body,
            "chunks": chunks,
        },
        "metadata": entry.meta.metadata,
    })
}

fn decode_body(content_type: Option<&str>, bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    match EntryBody::decode(content_type, bytes) {
        EntryBody::Json(value) => value,
        EntryBody::Raw(raw) => Value::from(String::from_utf8_lossy(&raw).into_owned()),
    }
}

fn storage_error(e: StoreError) -> Response {
    tracing::error!(error = %e, "introspection request failed");
    let kind = match e {
        StoreError::Corrupt { .. } => "corrupt_entry",
        _ => "storage_failure",
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": kind })),
    )
        .into_response()
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
