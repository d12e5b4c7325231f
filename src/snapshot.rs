//! Aggregate snapshots and the policy deciding when to take them.

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::error::StorageError;

/// Default snapshot cadence: one snapshot per 100 committed events.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// A point-in-time capture of an aggregate's state and version.
///
/// Used to avoid replaying the full event history when an aggregate is
/// loaded: catch-up resumes from `version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// Number of events folded into `state`.
    pub version: u64,
    /// Milliseconds since the Unix epoch when the snapshot was taken.
    pub recorded_at_ms: u64,
}

/// The persisted, type-erased form of a snapshot, as a storage backend
/// sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Serialized aggregate state.
    pub state: Value,
    /// Number of events folded into `state`.
    pub version: u64,
    /// Milliseconds since the Unix epoch when the snapshot was taken.
    pub recorded_at_ms: u64,
}

impl<A: Aggregate> Snapshot<A> {
    /// Erase the state type for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Codec`] if the state fails to serialize.
    pub fn into_record(self) -> Result<SnapshotRecord, StorageError> {
        Ok(SnapshotRecord {
            state: serde_json::to_value(&self.state)?,
            version: self.version,
            recorded_at_ms: self.recorded_at_ms,
        })
    }

    /// Recover the typed snapshot from its persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Codec`] if the persisted state no longer
    /// matches the aggregate's state type.
    pub fn from_record(record: SnapshotRecord) -> Result<Self, StorageError> {
        Ok(Self {
            state: serde_json::from_value(record.state)?,
            version: record.version,
            recorded_at_ms: record.recorded_at_ms,
        })
    }
}

/// When the repository writes a snapshot after committing events.
///
/// Cadence is count-based because the storage interface exposes
/// versions, not byte sizes. The exact threshold is a policy choice;
/// the default is [`DEFAULT_SNAPSHOT_INTERVAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// Never snapshot; every load replays the full history.
    Never,
    /// Snapshot whenever the version crosses a multiple of `n`.
    EveryN(NonZeroU64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

impl SnapshotPolicy {
    /// Snapshot every `n` committed events; `0` means never.
    pub fn every(n: u64) -> Self {
        match NonZeroU64::new(n) {
            Some(n) => Self::EveryN(n),
            None => Self::Never,
        }
    }

    /// Whether a commit that moved the stream from `previous_version` to
    /// `new_version` is due for a snapshot.
    pub fn due(&self, previous_version: u64, new_version: u64) -> bool {
        match self {
            Self::Never => false,
            Self::EveryN(n) => new_version / n.get() > previous_version / n.get(),
        }
    }
}
