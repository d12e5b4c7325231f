//! CQRS/event-sourcing engine: validated command dispatch, event-sourced
//! aggregates with snapshot-bounded replay, and multicast event fan-out.

mod aggregate;
pub use aggregate::{Aggregate, AggregateRoot, Lifecycle};
mod bus;
pub use bus::{
    CommandBus, CommandHandler, EventBus, EventSubscriber, PublishReport, SubscriberError,
    SubscriberFailure,
};
mod dispatch;
pub use dispatch::{EventFilter, MulticastBus, SubscriptionToken, UnicastBus};
mod engine;
pub use engine::{Engine, EngineBuilder, Submission};
mod envelope;
pub use envelope::{ActorContext, Envelope};
mod error;
pub use error::{DispatchError, EngineError, EnvelopeError, RoutingError, StorageError};
mod event;
pub use event::{EventEnvelope, EventRecord, StreamName, StreamRecord, stream_uuid};
mod repository;
pub use repository::Repository;
mod routing;
pub use routing::{RouteFn, RoutingStrategy};
mod snapshot;
pub use snapshot::{DEFAULT_SNAPSHOT_INTERVAL, Snapshot, SnapshotPolicy, SnapshotRecord};
mod storage;
pub use storage::{EventStore, FileStore, MemoryStore};
mod transaction;
pub use transaction::Transaction;
mod validation;
pub use validation::{ConstraintViolation, FieldValidator, ValidationGate};
