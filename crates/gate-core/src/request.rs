//! Normalized view of an incoming request.
//!
//! The listener converts each hyper request into a [`CanonicalRequest`] once;
//! fingerprinting, recording, and upstream forwarding all consume this view.

use std::collections::BTreeMap;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde_json::Value;

/// A client request in canonical form: method uppercased, path decoded and
/// trailing-slash-normalized, query sorted by name (value order within a
/// repeated name preserved), header names lowercased with trimmed values.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Full header map. The fingerprinter applies its own allow-list; the
    /// upstream client forwards everything except hop-by-hop headers.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes as received.
    pub body: Bytes,
}

impl CanonicalRequest {
    pub fn new(
        method: &str,
        path: &str,
        query: Vec<(String, String)>,
        headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Self {
        let mut query = query;
        // Stable sort: repeated names keep their insertion order.
        query.sort_by(|a, b| a.0.cmp(&b.0));

        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Self {
            method: method.to_ascii_uppercase(),
            path: normalize_path(path),
            query,
            headers,
            body,
        }
    }

    /// The `content-type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Whether the request body asks for a streamed response (`"stream": true`).
    pub fn wants_stream(&self) -> bool {
        self.parsed_body()
            .and_then(|v| v.get("stream").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// Parse the body as JSON when the content type allows it.
    pub fn parsed_body(&self) -> Option<Value> {
        let json_candidate = match self.content_type() {
            Some(ct) => ct
                .split(';')
                .next()
                .map(str::trim)
                .is_some_and(|t| t.eq_ignore_ascii_case("application/json")),
            None => true,
        };
        if !json_candidate {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Query parameters regrouped as an ordered name → values mapping.
    pub fn query_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.query {
            map.entry(name.clone()).or_default().push(value.clone());
        }
        map
    }
}

/// Percent-decode the path and drop any trailing slash except on the root.
fn normalize_path(path: &str) -> String {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    let mut path = if decoded.starts_with('/') {
        decoded.into_owned()
    } else {
        format!("/{decoded}")
    };
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}
