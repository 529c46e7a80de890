//! Request fingerprinting: a stable digest over a canonicalized request.
//!
//! Pure and infallible. Two requests that differ only in JSON key order,
//! header casing, or ignored headers (auth, user-agent, ...) collapse to the
//! same fingerprint; anything that changes the semantic request — method,
//! path, query, body values, `content-type`, the `stream` flag — produces a
//! different one.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::request::CanonicalRequest;

/// Headers that participate in the fingerprint. Everything else — notably
/// `authorization`, `user-agent`, `host`, tracing and hop-by-hop headers —
/// is excluded so the same recording serves clients with different keys.
pub const FINGERPRINT_HEADERS: &[&str] = &["content-type"];

/// Separator between digest input fields. An ASCII unit separator cannot
/// appear in a method, path, or canonical JSON, so field boundaries stay
/// unambiguous.
const FIELD_SEP: [u8; 1] = [0x1F];

/// Output of [`fingerprint`]: the storage key plus derived request attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    /// Lowercase hex SHA-256 over the canonical request, 64 chars.
    pub id: String,
    /// Independent digest over just the prompt (`messages` or `input`).
    pub prompt_hash: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

/// Derive the fingerprint of a canonicalized request.
pub fn fingerprint(request: &CanonicalRequest) -> Fingerprint {
    let body = request.parsed_body();
    let canonical_body = match &body {
        // Canonical JSON: objects key-sorted (serde_json's default map is a
        // BTreeMap), arrays in order, numbers re-emitted with their original
        // lexical token (arbitrary_precision), strings canonically escaped.
        Some(value) => serde_json::to_vec(value).unwrap_or_else(|_| request.body.to_vec()),
        None => request.body.to_vec(),
    };

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_bytes());
    hasher.update(FIELD_SEP);
    hasher.update(request.path.as_bytes());
    hasher.update(FIELD_SEP);
    hasher.update(canonical_query(request).as_bytes());
    hasher.update(FIELD_SEP);
    hasher.update(canonical_headers(request).as_bytes());
    hasher.update(FIELD_SEP);
    hasher.update(&canonical_body);
    let id = hex::encode(hasher.finalize());

    Fingerprint {
        id,
        prompt_hash: prompt_hash(body.as_ref()),
        model: body
            .as_ref()
            .and_then(|v| v.get("model").and_then(Value::as_str))
            .map(str::to_string),
        temperature: body
            .as_ref()
            .and_then(|v| v.get("temperature").and_then(Value::as_f64)),
    }
}

/// `name=value` pairs joined with `&`, already sorted by the canonical view.
fn canonical_query(request: &CanonicalRequest) -> String {
    let pairs: Vec<String> = request
        .query
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.join("&")
}

/// Allow-listed headers only, `name:value` joined with newlines.
fn canonical_headers(request: &CanonicalRequest) -> String {
    let mut lines = Vec::new();
    for name in FINGERPRINT_HEADERS {
        if let Some(value) = request.headers.get(*name) {
            lines.push(format!("{name}:{value}"));
        }
    }
    lines.join("\n")
}

/// SHA-256 over the canonical prompt field: `messages` for Chat Completions,
/// `input` for Responses. Hashes the empty string when neither is present.
fn prompt_hash(body: Option<&Value>) -> String {
    let prompt = body.and_then(|v| v.get("messages").or_else(|| v.get("input")));
    let canonical = match prompt {
        Some(value) => serde_json::to_vec(value).unwrap_or_default(),
        None => Vec::new(),
    };
    hex::encode(Sha256::digest(&canonical))
}
