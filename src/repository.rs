//! The aggregate repository: the only component that talks to storage.
//!
//! A `Repository<A>` orchestrates load (snapshot + replay) and save
//! (append + snapshot policy) for one aggregate type and is the unicast
//! handler the engine registers on the command bus for that type's
//! command keys.
//!
//! Commands for the same instance id are serialized through a per-id
//! lock: the second command's load cannot begin until the first
//! command's save has completed or aborted. Commands for distinct ids
//! run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::bus::CommandHandler;
use crate::envelope::{Envelope, epoch_millis, split_tagged};
use crate::error::{EngineError, EnvelopeError};
use crate::event::{EventEnvelope, EventRecord, StreamName};
use crate::routing::RoutingStrategy;
use crate::snapshot::{Snapshot, SnapshotPolicy};
use crate::storage::EventStore;
use crate::transaction::Transaction;
use crate::validation::ConstraintViolation;

/// Load/save orchestration and command handling for one aggregate type.
pub struct Repository<A: Aggregate> {
    store: Arc<dyn EventStore>,
    routing: RoutingStrategy,
    snapshots: SnapshotPolicy,
    /// Per-instance-id locks enforcing the single-writer guarantee.
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    _marker: std::marker::PhantomData<fn() -> A>,
}

impl<A: Aggregate> Repository<A> {
    /// A repository over the given store, routing rule, and snapshot
    /// cadence.
    pub fn new(store: Arc<dyn EventStore>, routing: RoutingStrategy, snapshots: SnapshotPolicy) -> Self {
        Self {
            store,
            routing,
            snapshots,
            locks: RwLock::new(HashMap::new()),
            _marker: std::marker::PhantomData,
        }
    }

    /// The routing rule this repository resolves instance ids with.
    pub fn routing(&self) -> &RoutingStrategy {
        &self.routing
    }

    /// The per-id mutex, created on first use.
    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        // Fast path: the lock already exists.
        {
            let locks = self.locks.read().expect("lock table poisoned");
            if let Some(lock) = locks.get(id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.locks.write().expect("lock table poisoned");
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Reconstruct an aggregate's `(state, version)` from its history.
    ///
    /// Loading the same id twice without an intervening save yields
    /// identical results.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Storage`] -- the storage collaborator failed.
    /// * [`EngineError::CorruptHistory`] -- the history is inconsistent.
    pub async fn load(&self, id: &str) -> Result<(A, u64), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let root = self.load_root(id).await?;
        Ok((root.state().clone(), root.version()))
    }

    /// Snapshot + replay, without taking the per-id lock. Callers hold it.
    async fn load_root(&self, id: &str) -> Result<AggregateRoot<A>, EngineError> {
        let stream = StreamName::new(A::AGGREGATE_TYPE, id);
        let mut root = AggregateRoot::new(id);

        // Start from the latest snapshot when one exists and still
        // decodes; a corrupt snapshot is a cache miss, not an error --
        // the event history remains authoritative.
        let (mut state, mut version) = match self.store.read_latest_snapshot(&stream).await? {
            Some(record) => match Snapshot::<A>::from_record(record) {
                Ok(snapshot) => (snapshot.state, snapshot.version),
                Err(error) => {
                    tracing::warn!(
                        stream = %stream,
                        %error,
                        "failed to decode snapshot; replaying full history"
                    );
                    (A::default(), 0)
                }
            },
            None => (A::default(), 0),
        };

        let records = self.store.read_events_after(&stream, version).await?;
        let mut last_timestamp = 0u64;
        for record in &records {
            if record.version != version + 1 {
                return Err(EngineError::CorruptHistory {
                    stream: stream.to_string(),
                    detail: format!(
                        "non-contiguous versions: expected {}, found {}",
                        version + 1,
                        record.version
                    ),
                });
            }
            if record.recorded_at_ms < last_timestamp {
                return Err(EngineError::CorruptHistory {
                    stream: stream.to_string(),
                    detail: format!(
                        "non-monotonic timestamps: {} after {}",
                        record.recorded_at_ms, last_timestamp
                    ),
                });
            }
            let event: A::DomainEvent = serde_json::from_value(crate::envelope::join_tagged(
                &record.type_key,
                &record.payload,
            ))
            .map_err(|e| EngineError::CorruptHistory {
                stream: stream.to_string(),
                detail: format!("event '{}' at version {} does not apply: {e}", record.type_key, record.version),
            })?;
            state = state.apply(&event);
            version = record.version;
            last_timestamp = record.recorded_at_ms;
        }

        tracing::debug!(stream = %stream, version, replayed = records.len(), "aggregate loaded");
        root.restore(state, version);
        Ok(root)
    }

    /// Append committed records and evaluate the snapshot policy.
    ///
    /// The append is atomic with respect to concurrent loads of the same
    /// id: the storage contract forbids torn batches, and the per-id
    /// lock keeps a second writer out until this save returns. A failed
    /// snapshot write is logged and swallowed -- the events are durable
    /// and history stays authoritative.
    async fn save(
        &self,
        root: &mut AggregateRoot<A>,
        records: &[EventRecord],
    ) -> Result<(), EngineError> {
        let stream = StreamName::new(A::AGGREGATE_TYPE, root.id());
        let previous_version = root.version() - records.len() as u64;

        root.begin_commit();
        self.store.append_events(&stream, records).await?;

        if self.snapshots.due(previous_version, root.version()) {
            let snapshot = Snapshot {
                state: root.state().clone(),
                version: root.version(),
                recorded_at_ms: epoch_millis(),
            };
            match snapshot.into_record() {
                Ok(record) => {
                    if let Err(error) = self.store.write_snapshot(&stream, record).await {
                        tracing::warn!(stream = %stream, %error, "snapshot write failed");
                    }
                }
                Err(error) => {
                    tracing::warn!(stream = %stream, %error, "snapshot encoding failed");
                }
            }
        }

        root.finish_commit();
        tracing::info!(stream = %stream, count = records.len(), "events appended");
        Ok(())
    }

    /// Full command cycle: route, load, handle in a transaction, save,
    /// and re-wrap the committed events for publication.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<Vec<EventEnvelope>, EngineError> {
        let id = self
            .routing
            .resolve(envelope.payload(), envelope.context())?;
        let span = tracing::info_span!(
            "dispatch",
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %id,
            type_key = envelope.type_key(),
        );
        self.dispatch_to(&id, envelope).instrument(span).await
    }

    async fn dispatch_to(
        &self,
        id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<EventEnvelope>, EngineError> {
        // Decode before taking the lock; a malformed payload needs no
        // serialization point.
        let command: A::Command = envelope.payload_as()?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut root = self.load_root(id).await?;
        let mut txn = Transaction::begin(&mut root);

        let events = match txn.state().handle(command) {
            Ok(events) => events,
            Err(rejection) => {
                tracing::debug!(
                    instance_id = id,
                    %rejection,
                    "command rejected by aggregate"
                );
                txn.rollback();
                return Err(EngineError::Rejected {
                    violations: vec![ConstraintViolation::new(rejection.to_string())],
                });
            }
        };

        // A designed no-op: nothing to persist or publish.
        if events.is_empty() {
            txn.commit();
            return Ok(Vec::new());
        }

        for event in events {
            txn.apply(event);
        }
        let (_state, version, staged) = txn.commit();

        let stream = StreamName::new(A::AGGREGATE_TYPE, id);
        let previous_version = version - staged.len() as u64;
        let mut records = Vec::with_capacity(staged.len());
        for (offset, event) in staged.iter().enumerate() {
            let value = serde_json::to_value(event).map_err(EnvelopeError::from)?;
            let (type_key, payload) = split_tagged(&value)?;
            records.push(EventRecord {
                event_id: Uuid::new_v4(),
                type_key,
                payload,
                version: previous_version + offset as u64 + 1,
                recorded_at_ms: epoch_millis(),
                origin: Some(envelope.id()),
                context: envelope.context().clone(),
            });
        }

        self.save(&mut root, &records).await?;

        Ok(records
            .iter()
            .map(|record| EventEnvelope::from_record(record, stream.clone()))
            .collect())
    }
}

impl<A: Aggregate> std::fmt::Debug for Repository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("routing", &self.routing)
            .field("snapshots", &self.snapshots)
            .finish()
    }
}

#[async_trait]
impl<A: Aggregate> CommandHandler for Repository<A> {
    async fn handle_command(&self, envelope: &Envelope) -> Result<Vec<EventEnvelope>, EngineError> {
        self.dispatch(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Wallet, WalletCommand};
    use crate::envelope::ActorContext;
    use crate::snapshot::SnapshotRecord;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn repository(store: Arc<MemoryStore>, snapshots: SnapshotPolicy) -> Repository<Wallet> {
        Repository::new(store, RoutingStrategy::by_field_index(0), snapshots)
    }

    fn deposit(id: &str, amount: i64) -> Envelope {
        Envelope::enclose(
            ActorContext::new("u-1", "t-1"),
            &WalletCommand::Deposit {
                wallet_id: id.to_string(),
                amount,
            },
        )
        .expect("enclose should succeed")
    }

    fn withdraw(id: &str, amount: i64) -> Envelope {
        Envelope::enclose(
            ActorContext::new("u-1", "t-1"),
            &WalletCommand::Withdraw {
                wallet_id: id.to_string(),
                amount,
            },
        )
        .expect("enclose should succeed")
    }

    #[tokio::test]
    async fn load_unknown_id_is_default_at_version_zero() {
        let repo = repository(Arc::new(MemoryStore::new()), SnapshotPolicy::Never);
        let (state, version) = repo.load("w-new").await.expect("load should succeed");
        assert_eq!(state, Wallet::default());
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn dispatch_persists_and_returns_event_envelopes() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);

        let envelope = deposit("w-1", 50);
        let events = repo
            .dispatch(&envelope)
            .await
            .expect("dispatch should succeed");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_key(), "Deposited");
        assert_eq!(events[0].version(), 1);
        assert_eq!(events[0].origin(), Some(envelope.id()));
        assert_eq!(events[0].producer().instance_id, "w-1");

        let (state, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(state.balance, 50);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn load_is_idempotent_without_intervening_save() {
        let repo = repository(Arc::new(MemoryStore::new()), SnapshotPolicy::Never);
        repo.dispatch(&deposit("w-1", 25))
            .await
            .expect("dispatch should succeed");

        let first = repo.load("w-1").await.expect("first load should succeed");
        let second = repo.load("w-1").await.expect("second load should succeed");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejected_command_leaves_history_untouched() {
        let repo = repository(Arc::new(MemoryStore::new()), SnapshotPolicy::Never);
        repo.dispatch(&deposit("w-1", 10))
            .await
            .expect("deposit should succeed");

        let result = repo.dispatch(&withdraw("w-1", 99)).await;
        match result {
            Err(EngineError::Rejected { violations }) => {
                assert!(!violations.is_empty());
                assert!(violations[0].message.contains("insufficient funds"));
            }
            other => panic!("expected Rejected, got: {other:?}"),
        }

        let (state, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(state.balance, 10, "state unchanged after rejection");
        assert_eq!(version, 1, "version unchanged after rejection");
    }

    #[tokio::test]
    async fn designed_noop_command_appends_nothing() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);
        repo.dispatch(&deposit("w-1", 10))
            .await
            .expect("deposit should succeed");

        let envelope = Envelope::enclose(
            ActorContext::new("u-1", "t-1"),
            &WalletCommand::Reconcile {
                wallet_id: "w-1".to_string(),
            },
        )
        .expect("enclose should succeed");
        let events = repo
            .dispatch(&envelope)
            .await
            .expect("reconcile should succeed");
        assert!(events.is_empty());

        let (_, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(version, 1, "no-op must not advance the version");
    }

    #[tokio::test]
    async fn snapshot_policy_writes_and_bounds_replay() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::every(2));

        repo.dispatch(&deposit("w-1", 10))
            .await
            .expect("dispatch should succeed");
        repo.dispatch(&deposit("w-1", 20))
            .await
            .expect("dispatch should succeed");

        let stream = StreamName::new("wallet", "w-1");
        let snapshot = store
            .read_latest_snapshot(&stream)
            .await
            .expect("read should succeed")
            .expect("a snapshot should exist after version 2");
        assert_eq!(snapshot.version, 2);

        repo.dispatch(&deposit("w-1", 5))
            .await
            .expect("dispatch should succeed");

        let (state, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(state.balance, 35);
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_full_replay() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);
        repo.dispatch(&deposit("w-1", 10))
            .await
            .expect("dispatch should succeed");
        repo.dispatch(&deposit("w-1", 15))
            .await
            .expect("dispatch should succeed");

        // Plant a snapshot whose state no longer decodes.
        store
            .write_snapshot(
                &StreamName::new("wallet", "w-1"),
                SnapshotRecord {
                    state: json!("not a wallet"),
                    version: 2,
                    recorded_at_ms: epoch_millis(),
                },
            )
            .await
            .expect("write should succeed");

        let (state, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(state.balance, 25, "full replay recovers the state");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn non_contiguous_versions_are_corrupt_history() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);
        let stream = StreamName::new("wallet", "w-1");

        let make = |version: u64| EventRecord {
            event_id: Uuid::new_v4(),
            type_key: "Deposited".to_string(),
            payload: json!({"amount": 1}),
            version,
            recorded_at_ms: 1_000 + version,
            origin: None,
            context: ActorContext::new("u-1", "t-1"),
        };
        store
            .append_events(&stream, &[make(1), make(3)])
            .await
            .expect("append should succeed");

        let result = repo.load("w-1").await;
        assert!(
            matches!(result, Err(EngineError::CorruptHistory { .. })),
            "a version gap must be corrupt history, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn backwards_timestamps_are_corrupt_history() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);
        let stream = StreamName::new("wallet", "w-1");

        let make = |version: u64, ts: u64| EventRecord {
            event_id: Uuid::new_v4(),
            type_key: "Deposited".to_string(),
            payload: json!({"amount": 1}),
            version,
            recorded_at_ms: ts,
            origin: None,
            context: ActorContext::new("u-1", "t-1"),
        };
        store
            .append_events(&stream, &[make(1, 2_000), make(2, 1_000)])
            .await
            .expect("append should succeed");

        let result = repo.load("w-1").await;
        assert!(matches!(result, Err(EngineError::CorruptHistory { .. })));
    }

    #[tokio::test]
    async fn undecodable_event_is_corrupt_history() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);
        let stream = StreamName::new("wallet", "w-1");

        store
            .append_events(
                &stream,
                &[EventRecord {
                    event_id: Uuid::new_v4(),
                    type_key: "NeverHeardOfIt".to_string(),
                    payload: json!({"x": 1}),
                    version: 1,
                    recorded_at_ms: 1_000,
                    origin: None,
                    context: ActorContext::new("u-1", "t-1"),
                }],
            )
            .await
            .expect("append should succeed");

        let result = repo.load("w-1").await;
        assert!(matches!(result, Err(EngineError::CorruptHistory { .. })));
    }

    #[tokio::test]
    async fn missing_target_id_never_reaches_the_aggregate() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), SnapshotPolicy::Never);

        // Hand-built envelope whose payload lacks the identifier field.
        let envelope = Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::new("u-1", "t-1"),
            "Deposit",
            json!({"amount": 10}),
        );
        let result = repo.dispatch(&envelope).await;
        assert!(
            matches!(result, Err(EngineError::Routing(_))),
            "expected a routing error, got: {result:?}"
        );

        let events = store
            .read_events_after(&StreamName::new("wallet", "w-1"), 0)
            .await
            .expect("read should succeed");
        assert!(events.is_empty(), "nothing may be persisted");
    }

    #[tokio::test]
    async fn concurrent_commands_for_one_id_serialize() {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(repository(store.clone(), SnapshotPolicy::Never));

        let a = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { repo.dispatch(&deposit("w-1", 10)).await })
        };
        let b = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { repo.dispatch(&deposit("w-1", 20)).await })
        };
        a.await.expect("task a").expect("dispatch a should succeed");
        b.await.expect("task b").expect("dispatch b should succeed");

        let (state, version) = repo.load("w-1").await.expect("load should succeed");
        assert_eq!(version, 2, "both commands committed");
        assert_eq!(state.balance, 30);

        // The log holds contiguous versions in commit order.
        let records = store
            .read_events_after(&StreamName::new("wallet", "w-1"), 0)
            .await
            .expect("read should succeed");
        let versions: Vec<u64> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }
}
