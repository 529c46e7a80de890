//! End-to-end router scenarios against a scripted upstream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use gate_core::{
    CanonicalRequest, GateBody, GateResponse, Router, Store, Upstream, UpstreamBody,
    UpstreamError, UpstreamResponse,
};

enum Behavior {
    Buffered { status: u16, body: &'static [u8] },
    Streaming(Vec<Bytes>),
    Transport,
}

/// Scripted upstream that counts invocations.
struct MockUpstream {
    calls: AtomicUsize,
    behavior: Behavior,
}

impl MockUpstream {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            behavior,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn forward(
        &self,
        _request: &CanonicalRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent duplicates a window to pile up on the lock.
        tokio::time::sleep(Duration::from_millis(25)).await;
        match &self.behavior {
            Behavior::Buffered { status, body } => Ok(UpstreamResponse {
                status: *status,
                headers: BTreeMap::from([(
                    String::from("content-type"),
                    String::from("application/json"),
                )]),
                body: UpstreamBody::Buffered(Bytes::from_static(body)),
            }),
            Behavior::Streaming(chunks) => Ok(UpstreamResponse {
                status: 200,
                headers: BTreeMap::from([(
                    String::from("content-type"),
                    String::from("text/event-stream"),
                )]),
                body: UpstreamBody::Streaming(Box::pin(futures_util::stream::iter(
                    chunks.clone().into_iter().map(Ok),
                ))),
            }),
            Behavior::Transport => Err(UpstreamError::Transport(String::from(
                "connection refused",
            ))),
        }
    }
}

fn chat_request(body: &str, extra_headers: &[(&str, &str)]) -> CanonicalRequest {
    let mut headers = BTreeMap::from([(
        String::from("content-type"),
        String::from("application/json"),
    )]);
    for (name, value) in extra_headers {
        headers.insert(name.to_string(), value.to_string());
    }
    CanonicalRequest::new(
        "POST",
        "/v1/chat/completions",
        Vec::new(),
        headers,
        Bytes::copy_from_slice(body.as_bytes()),
    )
}

async fn collect(response: GateResponse) -> (u16, Bytes) {
    let status = response.status;
    match response.body {
        GateBody::Full(bytes) => (status, bytes),
        GateBody::Stream(mut stream) => {
            let mut all = Vec::new();
            while let Some(chunk) = stream.next().await {
                all.extend_from_slice(&chunk.expect("replay chunk"));
            }
            (status, Bytes::from(all))
        }
    }
}

const HI: &str = r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#;
const UPSTREAM_BODY: &[u8] = br#"{"id":"x","choices":[{"message":{"content":"Hello"}}]}"#;

#[tokio::test]
async fn first_request_records_second_replays() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Buffered {
        status: 200,
        body: UPSTREAM_BODY,
    });
    let router = Router::record_and_replay(store.clone(), upstream.clone());

    let (status, body) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 200);
    assert_eq!(body.as_ref(), UPSTREAM_BODY);
    assert_eq!(upstream.calls(), 1);
    assert_eq!(store.list().await.unwrap().len(), 1);

    let (status, body) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 200);
    assert_eq!(body.as_ref(), UPSTREAM_BODY, "replay is byte-identical");
    assert_eq!(upstream.calls(), 1, "second request never reaches upstream");
}

#[tokio::test]
async fn replay_only_miss_has_frozen_shape() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let router = Router::replay_only(store);

    let (status, body) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 404);

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "cache_miss");
    assert_eq!(
        parsed["message"],
        "No cached entry for this request; replay-only mode."
    );
    let id = parsed["id"].as_str().unwrap();
    assert_eq!(id.len(), 64);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn replay_only_serves_recorded_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Buffered {
        status: 200,
        body: UPSTREAM_BODY,
    });

    let recorder = Router::record_and_replay(store.clone(), upstream.clone());
    collect(recorder.handle(chat_request(HI, &[])).await).await;

    let replayer = Router::replay_only(store);
    let (status, body) = collect(replayer.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 200);
    assert_eq!(body.as_ref(), UPSTREAM_BODY);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn streaming_record_then_replay() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let chunks = vec![
        Bytes::from_static(b"data: {\"delta\":\"He\"}\n\n"),
        Bytes::from_static(b"data: {\"delta\":\"llo\"}\n\n"),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ];
    let upstream = MockUpstream::new(Behavior::Streaming(chunks.clone()));
    let router = Router::record_and_replay(store.clone(), upstream.clone());

    let streaming_hi =
        r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}],"stream":true}"#;

    // First pass: live tee from the upstream.
    let response = router.handle(chat_request(streaming_hi, &[])).await;
    assert_eq!(response.status, 200);
    let mut stream = match response.body {
        GateBody::Stream(s) => s,
        GateBody::Full(_) => panic!("expected streamed body"),
    };
    let mut live = Vec::new();
    while let Some(chunk) = stream.next().await {
        live.push(chunk.unwrap());
    }
    assert_eq!(live, chunks);

    // Publication finishes in the recording task; the per-id lock in the
    // second handle() call serializes against it.
    let response = router.handle(chat_request(streaming_hi, &[])).await;
    assert_eq!(upstream.calls(), 1, "replay never reaches upstream");
    assert_eq!(
        response.headers.get("content-type").unwrap(),
        "text/event-stream"
    );
    let mut stream = match response.body {
        GateBody::Stream(s) => s,
        GateBody::Full(_) => panic!("expected streamed body"),
    };
    let mut replayed = Vec::new();
    while let Some(chunk) = stream.next().await {
        replayed.push(chunk.unwrap());
    }
    assert_eq!(replayed, chunks, "chunks replay in recorded order");

    let summaries = store.list().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_streaming);
}

#[tokio::test]
async fn different_auth_keys_hit_the_same_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Buffered {
        status: 200,
        body: UPSTREAM_BODY,
    });
    let router = Router::record_and_replay(store.clone(), upstream.clone());

    collect(
        router
            .handle(chat_request(HI, &[("authorization", "Bearer sk-alice")]))
            .await,
    )
    .await;
    let (status, _) = collect(
        router
            .handle(chat_request(HI, &[("authorization", "Bearer sk-bob")]))
            .await,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(upstream.calls(), 1, "second key replays the first recording");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_duplicates_make_one_upstream_call() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Buffered {
        status: 200,
        body: UPSTREAM_BODY,
    });
    let router = Arc::new(Router::record_and_replay(store.clone(), upstream.clone()));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            collect(router.handle(chat_request(HI, &[])).await).await
        }));
    }
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body.as_ref(), UPSTREAM_BODY);
    }

    assert_eq!(upstream.calls(), 1, "single-flight");
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn transport_failure_is_502_and_not_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Transport);
    let router = Router::record_and_replay(store.clone(), upstream.clone());

    let (status, body) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 502);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "upstream_unreachable");
    assert!(store.list().await.unwrap().is_empty());

    // Transport failures are retried on the next request, not frozen.
    collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn upstream_error_statuses_are_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmp.path()).await.unwrap());
    let upstream = MockUpstream::new(Behavior::Buffered {
        status: 429,
        body: br#"{"error":{"type":"rate_limit_exceeded"}}"#,
    });
    let router = Router::record_and_replay(store.clone(), upstream.clone());

    let (status, _) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 429);
    let (status, _) = collect(router.handle(chat_request(HI, &[])).await).await;
    assert_eq!(status, 429);
    assert_eq!(upstream.calls(), 1, "the 429 itself replays from cache");
}
