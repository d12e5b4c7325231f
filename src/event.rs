//! Event envelopes, persisted records, and stream identity.
//!
//! The types here are the bridge between the in-memory world (typed
//! domain events inside envelopes) and the durable world (append-only
//! per-stream logs of tagged records). No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{ActorContext, Envelope};
use crate::error::EnvelopeError;
use crate::snapshot::SnapshotRecord;

/// Fixed namespace UUID for deterministic stream id derivation.
///
/// Stream ids are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same aggregate
/// identity always maps to the same stream id regardless of which
/// process performs the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5d, 0x84, 0x2a, 0xf1, 0x9c, 0x31, 0x4e, 0x02, 0x8a, 0x77, 0x43, 0x0e, 0x6b, 0xd1, 0x25, 0x9f,
]);

/// Derive a deterministic stream UUID from aggregate type and instance id.
///
/// # Examples
///
/// ```
/// use eventum::stream_uuid;
/// let id = stream_uuid("wallet", "w-1");
/// assert_eq!(id, stream_uuid("wallet", "w-1")); // deterministic
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    let name = format!("{aggregate_type}/{instance_id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Identity of one aggregate instance's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamName {
    /// The aggregate type name (e.g. "wallet").
    pub aggregate_type: String,
    /// The instance identifier within that type.
    pub instance_id: String,
}

impl StreamName {
    /// Name the stream for one aggregate instance.
    pub fn new(aggregate_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            instance_id: instance_id.into(),
        }
    }

    /// The deterministic UUID backends may key storage on.
    pub fn uuid(&self) -> Uuid {
        stream_uuid(&self.aggregate_type, &self.instance_id)
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.instance_id)
    }
}

/// The persisted form of one committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique id assigned when the event was committed.
    pub event_id: Uuid,
    /// The event's serde tag; doubles as the multicast dispatch key.
    pub type_key: String,
    /// The `"data"` portion of the domain event; `Null` for fieldless
    /// variants.
    pub payload: Value,
    /// Aggregate version after applying this event (1-based).
    pub version: u64,
    /// Milliseconds since the Unix epoch when the event was committed.
    pub recorded_at_ms: u64,
    /// Id of the command (or event) envelope that produced this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    /// Actor context propagated from the producing command.
    pub context: ActorContext,
}

/// One entry of a per-stream append-only log: an event or a snapshot,
/// tagged by kind and ordered by timestamp. At most the tail after the
/// latest snapshot needs replaying on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamRecord {
    /// A committed domain event.
    Event(EventRecord),
    /// A materialized aggregate state at a given version.
    Snapshot(SnapshotRecord),
}

impl StreamRecord {
    /// Timestamp of the record, whichever kind it is.
    pub fn recorded_at_ms(&self) -> u64 {
        match self {
            Self::Event(e) => e.recorded_at_ms,
            Self::Snapshot(s) => s.recorded_at_ms,
        }
    }

    /// The event record, if this entry is one.
    pub fn as_event(&self) -> Option<&EventRecord> {
        match self {
            Self::Event(e) => Some(e),
            Self::Snapshot(_) => None,
        }
    }

    /// The snapshot record, if this entry is one.
    pub fn as_snapshot(&self) -> Option<&SnapshotRecord> {
        match self {
            Self::Event(_) => None,
            Self::Snapshot(s) => Some(s),
        }
    }
}

/// A committed event as delivered to event-bus subscribers.
///
/// Wraps the plain [`Envelope`] with the causal origin (the envelope
/// that produced it), the producing aggregate's identity, and the
/// stream version, so subscribers can trace chains and order events
/// without consulting storage.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    envelope: Envelope,
    origin: Option<Uuid>,
    producer: StreamName,
    version: u64,
    recorded_at_ms: u64,
}

impl EventEnvelope {
    /// Re-wrap a committed record for publication.
    pub fn from_record(record: &EventRecord, producer: StreamName) -> Self {
        Self {
            envelope: Envelope::from_parts(
                record.event_id,
                record.context.clone(),
                record.type_key.clone(),
                record.payload.clone(),
            ),
            origin: record.origin,
            producer,
            version: record.version,
            recorded_at_ms: record.recorded_at_ms,
        }
    }

    /// The event's unique id.
    pub fn id(&self) -> Uuid {
        self.envelope.id()
    }

    /// Actor context propagated from the producing command.
    pub fn context(&self) -> &ActorContext {
        self.envelope.context()
    }

    /// The event's type key (serde tag).
    pub fn type_key(&self) -> &str {
        self.envelope.type_key()
    }

    /// The `"data"` portion of the event.
    pub fn payload(&self) -> &Value {
        self.envelope.payload()
    }

    /// Reconstruct the typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Codec`] if the payload no longer matches
    /// the target type.
    pub fn payload_as<E: serde::de::DeserializeOwned>(&self) -> Result<E, EnvelopeError> {
        self.envelope.payload_as()
    }

    /// Id of the envelope whose handling produced this event.
    pub fn origin(&self) -> Option<Uuid> {
        self.origin
    }

    /// The aggregate instance that emitted this event.
    pub fn producer(&self) -> &StreamName {
        &self.producer
    }

    /// Aggregate version after this event was applied.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Milliseconds since the Unix epoch at commit time.
    pub fn recorded_at_ms(&self) -> u64 {
        self.recorded_at_ms
    }
}
