//! Response representation handed back to the HTTP listener.

use std::collections::BTreeMap;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use serde_json::Value;

/// Boxed byte stream for streamed response bodies (live tee or replay).
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// What the router resolved a request to. The listener translates this into
/// its framework's response type; the core never touches hyper directly.
pub struct GateResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: GateBody,
}

pub enum GateBody {
    Full(Bytes),
    Stream(ByteStream),
}

impl GateResponse {
    /// A JSON response with the given status, used for the fixed-shape error
    /// bodies (`cache_miss`, `upstream_unreachable`, ...).
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: BTreeMap::from([(
                String::from("content-type"),
                String::from("application/json"),
            )]),
            body: GateBody::Full(Bytes::from(serde_json::to_vec(value).unwrap_or_default())),
        }
    }
}
