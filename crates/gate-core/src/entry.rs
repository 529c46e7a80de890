//! Cache entry data model: the unit of storage and its serialized views.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded request/response payload. JSON bodies keep their parsed structure
/// so the introspection API can render them; everything else stays raw.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Raw(Bytes),
}

impl Body {
    /// Decode a payload according to its content type. A `content-type` of
    /// `application/json` (or none at all) with a parseable body yields
    /// [`Body::Json`]; anything else falls back to raw bytes.
    pub fn decode(content_type: Option<&str>, bytes: &Bytes) -> Body {
        let json_candidate = match content_type {
            Some(ct) => ct
                .split(';')
                .next()
                .map(str::trim)
                .is_some_and(|t| t.eq_ignore_ascii_case("application/json")),
            None => true,
        };
        if json_candidate {
            if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                return Body::Json(value);
            }
        }
        Body::Raw(bytes.clone())
    }
}

/// Everything persisted in `meta.json`: the entry minus its payload files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Fingerprint digest, also the storage key.
    pub id: String,
    /// Unix seconds at publication time. Derived, never part of the fingerprint.
    #[serde(default)]
    pub created_at: u64,
    pub request: RequestMeta,
    pub response: ResponseMeta,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, Vec<String>>,
    /// Fingerprint-relevant header subset only (lowercased names).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub is_streaming: bool,
    /// Number of chunk files; zero for non-streaming entries.
    #[serde(default)]
    pub chunk_count: usize,
}

/// Derived request attributes kept for introspection and filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Digest over just the prompt/messages, independent of sampling params.
    pub prompt_hash: String,
}

/// A fully materialized entry as returned by `Store::get`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub meta: EntryMeta,
    /// Raw request body bytes as received from the client.
    pub request_body: Bytes,
    pub response: StoredBody,
}

/// Where an entry's response payload lives.
#[derive(Debug, Clone)]
pub enum StoredBody {
    /// Non-streaming: the full body, buffered.
    Full(Bytes),
    /// Streaming: numbered chunk files under `dir`, read lazily at replay time.
    Chunks { dir: PathBuf, count: usize },
}

/// Response payload handed to `Store::put` by the recorder.
#[derive(Debug, Clone)]
pub enum RecordedBody {
    Full(Bytes),
    Chunks(Vec<Bytes>),
}

/// One row of `Store::list` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

impl EntrySummary {
    pub fn from_meta(meta: &EntryMeta) -> Self {
        Self {
            id: meta.id.clone(),
            method: meta.request.method.clone(),
            path: meta.request.path.clone(),
            status_code: meta.response.status_code,
            is_streaming: meta.response.is_streaming,
            model: meta.metadata.model.clone(),
            created_at: meta.created_at,
        }
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub streaming_responses: u64,
    pub entries_by_model: BTreeMap<String, u64>,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
