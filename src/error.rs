//! Crate-level error types for envelopes, routing, dispatch, and persistence.

use crate::validation::ConstraintViolation;

/// Error returned when constructing or decoding a message envelope fails.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The message or actor context is null/default and cannot be enveloped.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The payload could not be serialized or deserialized.
    #[error("payload codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Error returned when a routing strategy cannot extract a target entity id.
///
/// Both variants are configuration errors: a correctly registered strategy
/// is total over the messages registered against it, so hitting one of
/// these at dispatch time means the registration was wrong.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The message has no identifier at the configured field index.
    #[error("no entity id at field index {index}")]
    MissingEntityId {
        /// The field index the strategy was configured with.
        index: usize,
    },

    /// The field at the configured index is not a routable identifier.
    #[error("field '{field}' cannot route: expected {expected}, found {found}")]
    TypeMismatch {
        /// Name of the offending field.
        field: String,
        /// What the strategy required.
        expected: &'static str,
        /// What the message actually carried.
        found: String,
    },
}

/// Error returned by dispatch registry operations.
///
/// Both variants are fatal setup-time errors, not runtime conditions.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A unicast registration collided with an existing handler.
    #[error("handler already registered for type key '{0}'")]
    DuplicateHandler(String),

    /// A unicast lookup found no handler for the message's type key.
    #[error("no handler registered for type key '{0}'")]
    UnregisteredType(String),
}

/// Error returned by an [`EventStore`](crate::storage::EventStore) backend.
///
/// Storage errors are transient from the engine's point of view: the
/// caller of `load`/`save` may retry, the engine never retries internally.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("record codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// Backend-specific failure (connection loss, lease expiry, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Top-level error for command submission and aggregate access.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Envelope construction or payload decoding failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The routing strategy could not resolve a target entity id.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Dispatch registry misconfiguration.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The storage collaborator failed; the caller may retry.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The durable history for a stream is internally inconsistent.
    ///
    /// Raised when replay encounters non-contiguous versions,
    /// non-monotonic timestamps, or an event payload that no longer
    /// deserializes. Fatal: never retried automatically.
    #[error("corrupt history for stream '{stream}': {detail}")]
    CorruptHistory {
        /// The stream whose history failed verification.
        stream: String,
        /// Human-readable description of the inconsistency.
        detail: String,
    },

    /// The command was refused by validation or by the aggregate's
    /// business rules. Carried as data so the submitter sees the full
    /// violation list; [`Engine::submit`](crate::Engine::submit) converts
    /// this into [`Submission::Rejected`](crate::Submission).
    #[error("command rejected with {} violation(s)", violations.len())]
    Rejected {
        /// Every violation found; never empty.
        violations: Vec<ConstraintViolation>,
    },
}
