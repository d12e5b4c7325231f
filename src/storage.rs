//! Event storage trait and built-in backends.
//!
//! Storage is a collaborator: the engine core talks to it only through
//! [`EventStore`]. Two reference backends ship with the crate -- an
//! in-memory store for tests and ephemeral use, and a file store that
//! keeps one JSONL log per stream. Both persist [`StreamRecord`]s:
//! events and snapshots interleaved in one ordered log, so a load never
//! replays more than the tail after the latest snapshot.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::event::{EventRecord, StreamName, StreamRecord};
use crate::snapshot::SnapshotRecord;

/// Durable, per-stream, append-only event storage.
///
/// # Contract
///
/// - `append_events` appends the batch atomically: a concurrent reader
///   sees either none or all of it, never a partial batch.
/// - `read_events_after` returns event records with version strictly
///   greater than `after_version`, in append order.
/// - Only the repository writes to a stream; backends do not need to
///   arbitrate concurrent writers for one stream.
/// - Errors are transient from the engine's point of view; the engine
///   never retries internally.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append committed events to the stream's log, in order.
    async fn append_events(
        &self,
        stream: &StreamName,
        records: &[EventRecord],
    ) -> Result<(), StorageError>;

    /// Events with version greater than `after_version`, in append order.
    async fn read_events_after(
        &self,
        stream: &StreamName,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Append a snapshot record to the stream's log.
    async fn write_snapshot(
        &self,
        stream: &StreamName,
        snapshot: SnapshotRecord,
    ) -> Result<(), StorageError>;

    /// The most recent snapshot in the stream's log, if any.
    async fn read_latest_snapshot(
        &self,
        stream: &StreamName,
    ) -> Result<Option<SnapshotRecord>, StorageError>;
}

/// In-memory [`EventStore`], keyed by deterministic stream UUID.
///
/// Batch appends happen under one write guard, so readers observe whole
/// batches only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: RwLock<HashMap<Uuid, Vec<StreamRecord>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_events(
        &self,
        stream: &StreamName,
        records: &[EventRecord],
    ) -> Result<(), StorageError> {
        let mut streams = self.streams.write().await;
        streams
            .entry(stream.uuid())
            .or_default()
            .extend(records.iter().cloned().map(StreamRecord::Event));
        Ok(())
    }

    async fn read_events_after(
        &self,
        stream: &StreamName,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(&stream.uuid())
            .map(|records| {
                records
                    .iter()
                    .filter_map(StreamRecord::as_event)
                    .filter(|event| event.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_snapshot(
        &self,
        stream: &StreamName,
        snapshot: SnapshotRecord,
    ) -> Result<(), StorageError> {
        let mut streams = self.streams.write().await;
        streams
            .entry(stream.uuid())
            .or_default()
            .push(StreamRecord::Snapshot(snapshot));
        Ok(())
    }

    async fn read_latest_snapshot(
        &self,
        stream: &StreamName,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let streams = self.streams.read().await;
        Ok(streams.get(&stream.uuid()).and_then(|records| {
            records
                .iter()
                .rev()
                .find_map(StreamRecord::as_snapshot)
                .cloned()
        }))
    }
}

/// File-backed [`EventStore`].
///
/// The on-disk layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate_type>/
///             <instance_id>/
///                 log.jsonl       -- StreamRecord per line, append-only
///     meta/
///         streams.jsonl           -- stream registry
/// ```
///
/// Each batch is serialized into a single buffer and appended with one
/// `write_all`, so a reader never parses a torn batch boundary.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given base directory. The directory
    /// does not need to exist yet; it is created lazily on first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>`
    pub fn stream_dir(&self, stream: &StreamName) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(&stream.aggregate_type)
            .join(&stream.instance_id)
    }

    fn log_path(&self, stream: &StreamName) -> PathBuf {
        self.stream_dir(stream).join("log.jsonl")
    }

    fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// Ensures the stream directory and registry entry exist.
    ///
    /// Idempotent: repeated calls for the same stream do not duplicate
    /// registry entries.
    async fn ensure_stream(&self, stream: &StreamName) -> Result<PathBuf, StorageError> {
        let dir = self.stream_dir(stream);
        tokio::fs::create_dir_all(&dir).await?;

        let meta = self.meta_dir();
        tokio::fs::create_dir_all(&meta).await?;
        let registry_path = meta.join("streams.jsonl");

        let already_registered = match tokio::fs::read_to_string(&registry_path).await {
            Ok(contents) => contents.lines().filter(|l| !l.is_empty()).any(|line| {
                serde_json::from_str::<serde_json::Value>(line).is_ok_and(|entry| {
                    entry.get("type").and_then(|v| v.as_str())
                        == Some(stream.aggregate_type.as_str())
                        && entry.get("id").and_then(|v| v.as_str())
                            == Some(stream.instance_id.as_str())
                })
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if !already_registered {
            let entry = serde_json::json!({
                "type": stream.aggregate_type,
                "id": stream.instance_id,
                "ts": crate::envelope::epoch_millis(),
            });
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)
                .await?;
            file.write_all(format!("{entry}\n").as_bytes()).await?;
        }

        Ok(dir)
    }

    /// Lists all instance ids registered for the given aggregate type,
    /// sorted. Returns an empty vector if no stream of that type exists.
    pub async fn list_streams(&self, aggregate_type: &str) -> Result<Vec<String>, StorageError> {
        let type_dir = self.base_dir.join("streams").join(aggregate_type);
        let mut entries = match tokio::fs::read_dir(&type_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Append a batch of records as one buffered write.
    async fn append_records(
        &self,
        stream: &StreamName,
        records: impl Iterator<Item = StreamRecord>,
    ) -> Result<(), StorageError> {
        self.ensure_stream(stream).await?;

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(stream))
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Parse the stream's full log. A missing log file is an empty
    /// stream, not an error.
    async fn read_log(&self, stream: &StreamName) -> Result<Vec<StreamRecord>, StorageError> {
        let contents = match tokio::fs::read_to_string(self.log_path(stream)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| Ok(serde_json::from_str::<StreamRecord>(line)?))
            .collect()
    }
}

#[async_trait]
impl EventStore for FileStore {
    async fn append_events(
        &self,
        stream: &StreamName,
        records: &[EventRecord],
    ) -> Result<(), StorageError> {
        self.append_records(stream, records.iter().cloned().map(StreamRecord::Event))
            .await
    }

    async fn read_events_after(
        &self,
        stream: &StreamName,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Ok(self
            .read_log(stream)
            .await?
            .iter()
            .filter_map(StreamRecord::as_event)
            .filter(|event| event.version > after_version)
            .cloned()
            .collect())
    }

    async fn write_snapshot(
        &self,
        stream: &StreamName,
        snapshot: SnapshotRecord,
    ) -> Result<(), StorageError> {
        self.append_records(stream, std::iter::once(StreamRecord::Snapshot(snapshot)))
            .await
    }

    async fn read_latest_snapshot(
        &self,
        stream: &StreamName,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        Ok(self
            .read_log(stream)
            .await?
            .iter()
            .rev()
            .find_map(StreamRecord::as_snapshot)
            .cloned())
    }
}
