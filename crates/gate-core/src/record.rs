//! Recording of upstream responses into the store.
//!
//! The buffered path is a plain put. The streaming path tees: every upstream
//! chunk is forwarded to the client channel as it arrives and appended to the
//! in-memory chunk list; the entry is published only after the upstream
//! stream ends cleanly. The recording task owns the upstream stream and the
//! per-id lock, so a client disconnect neither aborts the recording nor
//! leaks the lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio_stream::wrappers::ReceiverStream;

use crate::entry::{unix_now, Entry, EntryMeta, EntryMetadata, RecordedBody, RequestMeta, ResponseMeta, StoredBody};
use crate::error::StoreResult;
use crate::fingerprint::{Fingerprint, FINGERPRINT_HEADERS};
use crate::request::CanonicalRequest;
use crate::response::ByteStream;
use crate::store::Store;
use crate::upstream::ChunkStream;

/// Chunks buffered between the upstream reader and a slow client before
/// backpressure kicks in.
const TEE_CHANNEL_CAPACITY: usize = 16;

/// Record a fully buffered upstream response and hand back the materialized
/// entry so the caller can replay it without a disk round-trip.
pub async fn record_buffered(
    store: &Store,
    request: &CanonicalRequest,
    fp: &Fingerprint,
    status: u16,
    response_headers: BTreeMap<String, String>,
    body: Bytes,
) -> StoreResult<Entry> {
    let meta = build_meta(request, fp, status, response_headers, false, 0);
    store
        .put(&meta, &request.body, &RecordedBody::Full(body.clone()))
        .await?;
    Ok(Entry {
        meta,
        request_body: request.body.clone(),
        response: StoredBody::Full(body),
    })
}

/// Tee a streaming upstream response to the client while collecting chunks
/// for the store. Returns the client-facing stream immediately; publication
/// happens in a background task once the upstream finishes.
///
/// The task keeps draining the upstream after a client disconnect (the call
/// has already been paid for) and discards the partial recording if the
/// upstream itself aborts. `guard` is the per-id lock; it is released only
/// after the put, so waiters observe the freshly recorded entry.
pub fn record_streaming(
    store: Arc<Store>,
    guard: OwnedMutexGuard<()>,
    request: CanonicalRequest,
    fp: Fingerprint,
    status: u16,
    response_headers: BTreeMap<String, String>,
    mut upstream: ChunkStream,
) -> ByteStream {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(TEE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut aborted = false;
        let mut client_gone = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    chunks.push(chunk.clone());
                    if !client_gone && tx.send(Ok(chunk)).await.is_err() {
                        client_gone = true;
                        tracing::debug!(id = %fp.id, "client disconnected, recording continues");
                    }
                }
                Err(e) => {
                    aborted = true;
                    tracing::warn!(id = %fp.id, error = %e, "upstream stream aborted, discarding partial recording");
                    if !client_gone {
                        let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    }
                    break;
                }
            }
        }
        drop(tx);

        if !aborted {
            let meta = build_meta(&request, &fp, status, response_headers, true, chunks.len());
            if let Err(e) = store
                .put(&meta, &request.body, &RecordedBody::Chunks(chunks))
                .await
            {
                tracing::error!(id = %fp.id, error = %e, "failed to persist streaming entry");
            }
        }
        drop(guard);
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Assemble `meta.json` content for an entry. Only the fingerprint-relevant
/// request headers are retained.
pub fn build_meta(
    request: &CanonicalRequest,
    fp: &Fingerprint,
    status: u16,
    response_headers: BTreeMap<String, String>,
    is_streaming: bool,
    chunk_count: usize,
) -> EntryMeta {
    let request_headers = FINGERPRINT_HEADERS
        .iter()
        .filter_map(|name| {
            request
                .headers
                .get(*name)
                .map(|value| (name.to_string(), value.clone()))
        })
        .collect();

    EntryMeta {
        id: fp.id.clone(),
        created_at: unix_now(),
        request: RequestMeta {
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query_map(),
            headers: request_headers,
        },
        response: ResponseMeta {
            status_code: status,
            headers: response_headers,
            is_streaming,
            chunk_count,
        },
        metadata: EntryMetadata {
            model: fp.model.clone(),
            temperature: fp.temperature,
            prompt_hash: fp.prompt_hash.clone(),
        },
    }
}
