//! Replay of stored entries as client responses.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::entry::{Entry, StoredBody};
use crate::response::{GateBody, GateResponse};
use crate::store::chunk_file;

/// Materialize a stored entry into a response.
///
/// Non-streaming entries replay their buffered body with `content-length`
/// left to the transport to recompute. Streaming entries replay chunk files
/// in order, as fast as the client drains — recorded latency is deliberately
/// not reproduced. The SSE headers are asserted even when absent from the
/// stored set so downstream parsers always see a valid event stream.
pub fn replay(entry: &Entry) -> GateResponse {
    let mut headers: BTreeMap<String, String> = entry
        .meta
        .response
        .headers
        .iter()
        .filter(|(name, _)| name.as_str() != "content-length")
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let body = match &entry.response {
        StoredBody::Full(bytes) => GateBody::Full(bytes.clone()),
        StoredBody::Chunks { dir, count } => {
            headers.insert(
                String::from("content-type"),
                String::from("text/event-stream"),
            );
            headers.insert(String::from("cache-control"), String::from("no-cache"));
            headers.insert(String::from("connection"), String::from("keep-alive"));

            let paths: Vec<_> = (0..*count).map(|i| chunk_file(dir, i)).collect();
            let stream = futures_util::stream::iter(paths)
                .then(|path| async move { tokio::fs::read(path).await.map(Bytes::from) });
            GateBody::Stream(Box::pin(stream))
        }
    };

    GateResponse {
        status: entry.meta.response.status_code,
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entry::{EntryMeta, EntryMetadata, RecordedBody, RequestMeta, ResponseMeta};
    use crate::store::Store;

    fn meta(id: &str, streaming: bool, chunk_count: usize) -> EntryMeta {
        EntryMeta {
            id: id.to_string(),
            created_at: 0,
            request: RequestMeta {
                method: String::from("POST"),
                path: String::from("/v1/chat/completions"),
                query: BTreeMap::new(),
                headers: BTreeMap::new(),
            },
            response: ResponseMeta {
                status_code: 200,
                headers: BTreeMap::from([
                    (String::from("content-type"), String::from("application/json")),
                    (String::from("content-length"), String::from("999")),
                    (String::from("x-request-id"), String::from("req-1")),
                ]),
                is_streaming: streaming,
                chunk_count,
            },
            metadata: EntryMetadata {
                model: None,
                temperature: None,
                prompt_hash: String::new(),
            },
        }
    }

    #[test]
    fn buffered_replay_is_byte_identical_minus_content_length() {
        let body = Bytes::from_static(b"{\"choices\":[{\"message\":{\"content\":\"Hello\"}}]}");
        let entry = Entry {
            meta: meta(&hex::encode([0x11; 32]), false, 0),
            request_body: Bytes::new(),
            response: StoredBody::Full(body.clone()),
        };

        let resp = replay(&entry);
        assert_eq!(resp.status, 200);
        assert!(!resp.headers.contains_key("content-length"));
        assert_eq!(resp.headers.get("x-request-id").unwrap(), "req-1");
        match resp.body {
            GateBody::Full(replayed) => assert_eq!(replayed, body),
            GateBody::Stream(_) => panic!("expected buffered body"),
        }
    }

    #[tokio::test]
    async fn streaming_replay_yields_chunks_in_order_with_sse_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(tmp.path()).await.unwrap());
        let id = hex::encode([0x22; 32]);
        let chunks = vec![
            Bytes::from_static(b"data: {\"delta\":\"He\"}\n\n"),
            Bytes::from_static(b"data: {\"delta\":\"llo\"}\n\n"),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ];
        let mut m = meta(&id, true, chunks.len());
        // Stored headers deliberately lack the SSE set.
        m.response.headers = BTreeMap::new();
        store
            .put(&m, b"{}", &RecordedBody::Chunks(chunks.clone()))
            .await
            .unwrap();

        let entry = store.get(&id).await.unwrap().expect("entry present");
        let resp = replay(&entry);
        assert_eq!(
            resp.headers.get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(resp.headers.get("cache-control").unwrap(), "no-cache");
        assert_eq!(resp.headers.get("connection").unwrap(), "keep-alive");

        let mut stream = match resp.body {
            GateBody::Stream(s) => s,
            GateBody::Full(_) => panic!("expected chunk stream"),
        };
        let mut replayed = Vec::new();
        while let Some(item) = stream.next().await {
            replayed.push(item.unwrap());
        }
        assert_eq!(replayed, chunks);
    }
}
