//! Per-request state machine: fingerprint, lock, lookup, then replay or
//! forward-and-record.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::StoreError;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::record;
use crate::replay::replay;
use crate::request::CanonicalRequest;
use crate::response::{GateBody, GateResponse};
use crate::store::Store;
use crate::upstream::{sanitize_headers, Upstream, UpstreamBody};

/// Operating mode of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    RecordAndReplay,
    ReplayOnly,
}

enum ModeState {
    RecordAndReplay(Arc<dyn Upstream>),
    ReplayOnly,
}

/// Stateless across requests aside from the shared store.
pub struct Router {
    store: Arc<Store>,
    mode: ModeState,
}

impl Router {
    /// A router that forwards cache misses upstream and records the result.
    pub fn record_and_replay(store: Arc<Store>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            store,
            mode: ModeState::RecordAndReplay(upstream),
        }
    }

    /// A router that never contacts any upstream; misses get the fixed 404.
    pub fn replay_only(store: Arc<Store>) -> Self {
        Self {
            store,
            mode: ModeState::ReplayOnly,
        }
    }

    pub fn mode(&self) -> GateMode {
        match self.mode {
            ModeState::RecordAndReplay(_) => GateMode::RecordAndReplay,
            ModeState::ReplayOnly => GateMode::ReplayOnly,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Resolve one request. All errors are translated to HTTP here; the
    /// method itself never fails.
    pub async fn handle(&self, request: CanonicalRequest) -> GateResponse {
        let start = Instant::now();
        let fp = fingerprint(&request);

        // Held across the whole get/forward/record span: concurrent requests
        // with the same fingerprint serialize here, so at most one upstream
        // call happens per fingerprint and the rest replay the fresh entry.
        let guard = self.store.lock(&fp.id).await;

        let cached = match self.store.get(&fp.id).await {
            Ok(entry) => entry,
            Err(e @ StoreError::Corrupt { .. }) => {
                tracing::warn!(id = %fp.id, error = %e, "corrupt entry treated as cache miss");
                None
            }
            Err(e) => {
                tracing::error!(id = %fp.id, error = %e, "store lookup failed");
                log_request(&fp, "storage_error", 500, start);
                return GateResponse::json(500, &json!({ "error": "storage_failure" }));
            }
        };

        if let Some(entry) = cached {
            let response = replay(&entry);
            log_request(&fp, "hit", response.status, start);
            return response;
        }

        let upstream = match &self.mode {
            ModeState::ReplayOnly => {
                log_request(&fp, "miss", 404, start);
                return cache_miss(&fp.id);
            }
            ModeState::RecordAndReplay(upstream) => upstream,
        };

        let upstream_response = match upstream.forward(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id = %fp.id, error = %e, "upstream unreachable");
                log_request(&fp, "upstream_error", 502, start);
                return GateResponse::json(502, &json!({ "error": "upstream_unreachable" }));
            }
        };

        let status = upstream_response.status;
        let headers = sanitize_headers(&upstream_response.headers);

        match upstream_response.body {
            UpstreamBody::Buffered(body) => {
                // Recording runs in its own task so a client disconnect after
                // the upstream response is fully received cannot cancel the
                // put; the lock guard travels with it.
                let store = self.store.clone();
                let record_request = request.clone();
                let record_fp = fp.clone();
                let record_headers = headers.clone();
                let recorded = tokio::spawn(async move {
                    let result = record::record_buffered(
                        &store,
                        &record_request,
                        &record_fp,
                        status,
                        record_headers,
                        body,
                    )
                    .await;
                    drop(guard);
                    result
                })
                .await;

                match recorded {
                    Ok(Ok(entry)) => {
                        log_request(&fp, "record", status, start);
                        replay(&entry)
                    }
                    Ok(Err(e)) => {
                        tracing::error!(id = %fp.id, error = %e, "failed to record upstream response");
                        log_request(&fp, "storage_error", 500, start);
                        GateResponse::json(500, &json!({ "error": "storage_failure" }))
                    }
                    Err(e) => {
                        tracing::error!(id = %fp.id, error = %e, "recording task panicked");
                        log_request(&fp, "storage_error", 500, start);
                        GateResponse::json(500, &json!({ "error": "storage_failure" }))
                    }
                }
            }
            UpstreamBody::Streaming(chunks) => {
                let body = record::record_streaming(
                    self.store.clone(),
                    guard,
                    request,
                    fp.clone(),
                    status,
                    headers.clone(),
                    chunks,
                );
                log_request(&fp, "record", status, start);
                GateResponse {
                    status,
                    headers,
                    body: GateBody::Stream(body),
                }
            }
        }
    }
}

/// The frozen replay-only miss contract: test suites detect this exact shape.
fn cache_miss(id: &str) -> GateResponse {
    GateResponse::json(
        404,
        &json!({
            "error": "cache_miss",
            "id": id,
            "message": "No cached entry for this request; replay-only mode.",
        }),
    )
}

/// The one required observability record per request.
fn log_request(fp: &Fingerprint, outcome: &str, status: u16, start: Instant) {
    tracing::info!(
        id = %fp.id,
        outcome,
        status,
        duration_ms = start.elapsed().as_millis() as u64,
        model = fp.model.as_deref().unwrap_or(""),
        "request resolved"
    );
}
