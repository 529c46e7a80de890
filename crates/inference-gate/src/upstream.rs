//! reqwest-backed upstream client.
//!
//! Forwards the canonical request to the origin API with hop-by-hop headers
//! stripped, injecting the configured API key when the client sent none.
//! Connect failures map to `UpstreamError::Transport`; HTTP error statuses
//! pass through as ordinary responses (and get recorded like any other).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use gate_core::upstream::{
    ChunkStream, Upstream, UpstreamBody, UpstreamError, UpstreamResponse, HOP_BY_HOP_HEADERS,
};
use gate_core::CanonicalRequest;
use http::{HeaderName, HeaderValue};

/// Connect-phase timeout. No overall request timeout is set: streamed
/// completions legitimately run for minutes, and replay mode never waits on
/// this client at all.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(base_url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        request: &CanonicalRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| UpstreamError::Transport(format!("invalid method: {e}")))?;
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self.client.request(method, &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let mut has_auth = false;
        for (name, value) in &request.headers {
            let name = name.as_str();
            // accept-encoding is excluded from the fingerprint, so recorded
            // bodies must stay unencoded; never ask the upstream to compress.
            if HOP_BY_HOP_HEADERS.contains(&name)
                || name == "host"
                || name == "content-length"
                || name == "accept-encoding"
            {
                continue;
            }
            if name == "authorization" {
                has_auth = true;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            builder = builder.header(name, value);
        }
        if !has_auth {
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = if is_streaming_response(request, &headers) {
            let chunks: ChunkStream = Box::pin(
                response
                    .bytes_stream()
                    .map_err(|e| UpstreamError::Stream(e.to_string())),
            );
            UpstreamBody::Streaming(chunks)
        } else {
            let bytes: Bytes = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            UpstreamBody::Buffered(bytes)
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// A response is treated as a stream when the upstream says so
/// (`text/event-stream`) or when the request asked to stream and the
/// response is chunked (no `content-length`).
fn is_streaming_response(
    request: &CanonicalRequest,
    response_headers: &BTreeMap<String, String>,
) -> bool {
    if response_headers
        .get("content-type")
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
    {
        return true;
    }
    request.wants_stream() && !response_headers.contains_key("content-length")
}
