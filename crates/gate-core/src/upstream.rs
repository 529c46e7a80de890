//! Upstream collaborator interface.
//!
//! The core never talks to the origin API directly; it consumes this trait.
//! A transport failure (no status line received) is a distinct error — HTTP
//! error statuses arrive as ordinary responses and get cached like any other
//! outcome.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use thiserror::Error;

use crate::request::CanonicalRequest;

/// Headers that must not be forwarded in either direction (RFC 9110 §7.6.1),
/// nor recorded: they describe the connection, not the message.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Response yielded by an upstream forward: either fully buffered or a chunk
/// stream at the boundaries the origin delivered them.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: UpstreamBody,
}

pub enum UpstreamBody {
    Buffered(Bytes),
    Streaming(ChunkStream),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream could not be reached at all: connect failure, DNS, timeout
    /// before any status line.
    #[error("upstream transport failure: {0}")]
    Transport(String),

    /// The response stream broke after the status line (connection reset
    /// mid-body). Partial recordings are discarded on this error.
    #[error("upstream stream aborted: {0}")]
    Stream(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: &CanonicalRequest)
        -> Result<UpstreamResponse, UpstreamError>;
}

/// Drop hop-by-hop headers and `content-length` from a recorded or forwarded
/// header map; the transport recomputes framing for the replayed message.
pub fn sanitize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "content-length" && !HOP_BY_HOP_HEADERS.contains(&name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
