//! Content-addressed on-disk store.
//!
//! Each entry lives at `{root}/{id[0..2]}/{id}/` (two-hex-char fan-out):
//!
//! ```text
//! meta.json          everything except the payloads
//! request.bin        raw request body bytes
//! response.bin       raw response body (non-streaming entries)
//! chunks/NNNNNN.bin  numbered stream chunks (streaming entries)
//! chunks/index       expected chunk count
//! ```
//!
//! Publication is atomic: files are written and fsynced into a sibling
//! `{id}.tmp/` directory which is then renamed into place. Readers never see
//! the `.tmp` name, so a crash mid-write leaves an orphan that `get`/`list`
//! ignore and the startup sweep removes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::entry::{CacheStats, Entry, EntryMeta, EntrySummary, RecordedBody, StoredBody};
use crate::error::{StoreError, StoreResult};

const META_FILE: &str = "meta.json";
const REQUEST_FILE: &str = "request.bin";
const RESPONSE_FILE: &str = "response.bin";
const CHUNKS_DIR: &str = "chunks";
const CHUNK_INDEX_FILE: &str = "index";
const TMP_SUFFIX: &str = ".tmp";

pub struct Store {
    root: PathBuf,
    /// Per-fingerprint mutexes for the single-flight guarantee. Entries are
    /// pruned once no guard or waiter holds them.
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Store {
    /// Open (and create if needed) a store root, sweeping orphaned `.tmp`
    /// directories left behind by interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            locks: parking_lot::Mutex::new(HashMap::new()),
        };
        store.sweep_orphans().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire the per-id exclusive lock. The guard is owned so it can move
    /// into a recording task and outlive the request handler; release happens
    /// on drop, on every exit path.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Fetch a fully materialized entry. Absent (or never-published) entries
    /// return `Ok(None)`; a published `meta.json` with missing side files is
    /// a [`StoreError::Corrupt`].
    pub async fn get(&self, id: &str) -> StoreResult<Option<Entry>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        let dir = self.entry_dir(id);
        let meta_bytes = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMeta = serde_json::from_slice(&meta_bytes).map_err(|e| {
            StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("unreadable meta.json: {e}"),
            }
        })?;

        let request_body = tokio::fs::read(dir.join(REQUEST_FILE))
            .await
            .map(Bytes::from)
            .map_err(|e| corrupt(id, REQUEST_FILE, e))?;

        let response = if meta.response.is_streaming {
            let chunks_dir = dir.join(CHUNKS_DIR);
            let count = self.read_chunk_index(id, &chunks_dir).await?;
            if count != meta.response.chunk_count {
                return Err(StoreError::Corrupt {
                    id: id.to_string(),
                    reason: format!(
                        "chunk index says {count}, meta.json says {}",
                        meta.response.chunk_count
                    ),
                });
            }
            let on_disk = count_chunk_files(&chunks_dir).await?;
            if on_disk != count {
                return Err(StoreError::Corrupt {
                    id: id.to_string(),
                    reason: format!("expected {count} chunk files, found {on_disk}"),
                });
            }
            StoredBody::Chunks {
                dir: chunks_dir,
                count,
            }
        } else {
            tokio::fs::read(dir.join(RESPONSE_FILE))
                .await
                .map(Bytes::from)
                .map(StoredBody::Full)
                .map_err(|e| corrupt(id, RESPONSE_FILE, e))?
        };

        Ok(Some(Entry {
            meta,
            request_body,
            response,
        }))
    }

    /// Publish an entry atomically. Concurrent writers for the same id race
    /// benignly: whichever rename lands first wins, and responses to the same
    /// fingerprint are assumed equivalent.
    pub async fn put(
        &self,
        meta: &EntryMeta,
        request_body: &[u8],
        response: &RecordedBody,
    ) -> StoreResult<()> {
        let final_dir = self.entry_dir(&meta.id);
        let fan_dir = self.root.join(&meta.id[..2]);
        tokio::fs::create_dir_all(&fan_dir).await?;

        let tmp_dir = fan_dir.join(format!("{}{TMP_SUFFIX}", meta.id));
        if tokio::fs::try_exists(&tmp_dir).await? {
            tokio::fs::remove_dir_all(&tmp_dir).await?;
        }
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let meta_json = serde_json::to_vec_pretty(meta)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        write_synced(tmp_dir.join(META_FILE), &meta_json).await?;
        write_synced(tmp_dir.join(REQUEST_FILE), request_body).await?;

        match response {
            RecordedBody::Full(body) => {
                write_synced(tmp_dir.join(RESPONSE_FILE), body).await?;
            }
            RecordedBody::Chunks(chunks) => {
                let chunks_dir = tmp_dir.join(CHUNKS_DIR);
                tokio::fs::create_dir_all(&chunks_dir).await?;
                for (i, chunk) in chunks.iter().enumerate() {
                    write_synced(chunk_file(&chunks_dir, i), chunk).await?;
                }
                write_synced(
                    chunks_dir.join(CHUNK_INDEX_FILE),
                    format!("{}\n", chunks.len()).as_bytes(),
                )
                .await?;
            }
        }

        match tokio::fs::rename(&tmp_dir, &final_dir).await {
            Ok(()) => Ok(()),
            Err(_) if tokio::fs::try_exists(&final_dir).await.unwrap_or(false) => {
                // A concurrent writer published first; ours is redundant.
                let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Walk every published entry and yield summaries. Order is unspecified.
    pub async fn list(&self) -> StoreResult<Vec<EntrySummary>> {
        let mut summaries = Vec::new();
        for dir in self.entry_dirs().await? {
            match read_meta(&dir).await {
                Ok(meta) => summaries.push(EntrySummary::from_meta(&meta)),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                }
            }
        }
        Ok(summaries)
    }

    /// Aggregate statistics over every published entry.
    pub async fn stats(&self) -> StoreResult<CacheStats> {
        let mut stats = CacheStats::default();
        for dir in self.entry_dirs().await? {
            let meta = match read_meta(&dir).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            stats.total_entries += 1;
            if meta.response.is_streaming {
                stats.streaming_responses += 1;
            }
            let model = meta
                .metadata
                .model
                .unwrap_or_else(|| String::from("unknown"));
            *stats.entries_by_model.entry(model).or_insert(0) += 1;
            stats.total_size_bytes += dir_size(&dir).await?;
        }
        Ok(stats)
    }

    /// Remove every entry under the root. Refuses when the directory has
    /// content but nothing in it looks like a cache entry, to limit the blast
    /// radius of a mistyped path.
    pub async fn clear(&self) -> StoreResult<()> {
        let mut children = Vec::new();
        let mut read = tokio::fs::read_dir(&self.root).await?;
        while let Some(child) = read.next_entry().await? {
            children.push(child.path());
        }
        if children.is_empty() {
            return Ok(());
        }
        if self.entry_dirs().await?.is_empty() {
            return Err(StoreError::NotCacheRoot {
                path: self.root.clone(),
            });
        }
        for child in children {
            if child.is_dir() {
                tokio::fs::remove_dir_all(&child).await?;
            } else {
                tokio::fs::remove_file(&child).await?;
            }
        }
        Ok(())
    }

    /// Eagerly load a streaming entry's chunks (introspection API; replay
    /// streams them lazily instead).
    pub async fn read_chunks(&self, body: &StoredBody) -> StoreResult<Vec<Bytes>> {
        match body {
            StoredBody::Full(_) => Ok(Vec::new()),
            StoredBody::Chunks { dir, count } => {
                let mut chunks = Vec::with_capacity(*count);
                for i in 0..*count {
                    chunks.push(Bytes::from(tokio::fs::read(chunk_file(dir, i)).await?));
                }
                Ok(chunks)
            }
        }
    }

    fn entry_dir(&self, id: &str) -> PathBuf {
        self.root.join(&id[..2]).join(id)
    }

    /// All published entry directories: `{root}/{xx}/{id}`, `.tmp` excluded.
    async fn entry_dirs(&self) -> StoreResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut fans = tokio::fs::read_dir(&self.root).await?;
        while let Some(fan) = fans.next_entry().await? {
            if !fan.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(fan.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !entry.file_type().await?.is_dir() || name.ends_with(TMP_SUFFIX) {
                    continue;
                }
                if is_valid_id(&name) {
                    dirs.push(entry.path());
                }
            }
        }
        Ok(dirs)
    }

    async fn sweep_orphans(&self) -> StoreResult<()> {
        let mut fans = tokio::fs::read_dir(&self.root).await?;
        while let Some(fan) = fans.next_entry().await? {
            if !fan.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(fan.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                    tracing::debug!(path = %entry.path().display(), "removing orphaned tmp dir");
                    tokio::fs::remove_dir_all(entry.path()).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_chunk_index(&self, id: &str, chunks_dir: &Path) -> StoreResult<usize> {
        let raw = tokio::fs::read_to_string(chunks_dir.join(CHUNK_INDEX_FILE))
            .await
            .map_err(|e| corrupt(id, "chunks/index", e))?;
        raw.trim().parse().map_err(|_| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("unparseable chunk index: {raw:?}"),
        })
    }
}

/// Path of chunk `index` inside a `chunks/` directory (zero-padded so a plain
/// directory listing sorts in replay order).
pub fn chunk_file(chunks_dir: &Path, index: usize) -> PathBuf {
    chunks_dir.join(format!("{index:06}.bin"))
}

/// Entry ids are 64 lowercase hex chars; anything else (notably path
/// separators from untrusted introspection input) is rejected up front.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn corrupt(id: &str, file: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("missing {file}"),
        }
    } else {
        StoreError::Io(e)
    }
}

async fn read_meta(entry_dir: &Path) -> StoreResult<EntryMeta> {
    let bytes = tokio::fs::read(entry_dir.join(META_FILE)).await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        id: entry_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        reason: format!("unreadable meta.json: {e}"),
    })
}

async fn count_chunk_files(chunks_dir: &Path) -> StoreResult<usize> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(chunks_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().ends_with(".bin") {
            count += 1;
        }
    }
    Ok(count)
}

async fn dir_size(dir: &Path) -> StoreResult<u64> {
    let mut size = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let ft = entry.file_type().await?;
            if ft.is_dir() {
                stack.push(entry.path());
            } else {
                size += entry.metadata().await?.len();
            }
        }
    }
    Ok(size)
}

async fn write_synced(path: PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
