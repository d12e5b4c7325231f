//! Top-level entry point that composes the validation gate, command bus,
//! aggregate repositories, and event bus into a single [`Engine`].
//!
//! The engine is opened via [`EngineBuilder`], which collects the
//! storage collaborator, snapshot policy, aggregate registrations, field
//! validators, and initial subscribers, then wires everything at
//! [`build`](EngineBuilder::build) time so configuration errors
//! (duplicate handlers, unroutable strategies) fail setup, not dispatch.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::bus::{CommandBus, EventBus, EventSubscriber, PublishReport};
use crate::dispatch::{EventFilter, SubscriptionToken};
use crate::envelope::{ActorContext, Envelope, split_tagged};
use crate::error::{DispatchError, EngineError};
use crate::event::EventEnvelope;
use crate::repository::Repository;
use crate::routing::RoutingStrategy;
use crate::snapshot::SnapshotPolicy;
use crate::storage::{EventStore, MemoryStore};
use crate::validation::{ConstraintViolation, FieldValidator, ValidationGate};

/// Outcome of one command submission: either the command was accepted
/// and its events committed and published, or it was rejected with the
/// full violation list. There is no partial success.
#[derive(Debug)]
pub enum Submission {
    /// The command committed; `events` are the published envelopes and
    /// `publish` reports fan-out delivery, including any subscriber
    /// failures (reported, not retried).
    Accepted {
        /// The committed events, in production order.
        events: Vec<EventEnvelope>,
        /// Fan-out outcome for those events.
        publish: PublishReport,
    },
    /// Validation or a business rule refused the command.
    Rejected {
        /// Every violation found; never empty.
        violations: Vec<ConstraintViolation>,
    },
}

impl Submission {
    /// Whether the command was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// The committed events, empty for rejections.
    pub fn events(&self) -> &[EventEnvelope] {
        match self {
            Self::Accepted { events, .. } => events,
            Self::Rejected { .. } => &[],
        }
    }

    /// The violations, empty for acceptances.
    pub fn violations(&self) -> &[ConstraintViolation] {
        match self {
            Self::Accepted { .. } => &[],
            Self::Rejected { violations } => violations,
        }
    }
}

/// Type-erased repository map keyed by aggregate `TypeId`.
///
/// Each value is an `Arc<Repository<A>>` for some concrete `A`;
/// downcasting recovers the typed repository.
type RepositoryMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// The assembled CQRS engine.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped -- so one
/// engine can be shared across concurrent submitters freely.
#[derive(Clone)]
pub struct Engine {
    commands: Arc<CommandBus>,
    events: Arc<EventBus>,
    repositories: Arc<RepositoryMap>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("commands", &self.commands.registered_keys())
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Submit one command envelope.
    ///
    /// Validation refusals and business-rule rejections come back as
    /// [`Submission::Rejected`]; infrastructure failures (storage,
    /// corrupt history, configuration) are errors.
    pub async fn submit(&self, envelope: Envelope) -> Result<Submission, EngineError> {
        match self.commands.post(&envelope).await {
            Ok(events) => {
                let publish = self.events.publish_all(&events).await;
                if !publish.failures.is_empty() {
                    tracing::warn!(
                        failed = publish.failures.len(),
                        delivered = publish.delivered,
                        "event fan-out completed with subscriber failures"
                    );
                }
                Ok(Submission::Accepted { events, publish })
            }
            Err(EngineError::Rejected { violations }) => Ok(Submission::Rejected { violations }),
            Err(error) => Err(error),
        }
    }

    /// Enclose a typed command and submit it.
    pub async fn submit_command<A: Aggregate>(
        &self,
        command: &A::Command,
        context: ActorContext,
    ) -> Result<Submission, EngineError> {
        let envelope = Envelope::enclose(context, command)?;
        self.submit(envelope).await
    }

    /// Reconstruct an aggregate's `(state, version)` from its history.
    pub async fn load<A: Aggregate>(&self, id: &str) -> Result<(A, u64), EngineError> {
        self.repository::<A>()?.load(id).await
    }

    /// The typed repository for a registered aggregate type.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnregisteredType`] if the type was never
    /// registered with the builder.
    pub fn repository<A: Aggregate>(&self) -> Result<Arc<Repository<A>>, EngineError> {
        self.repositories
            .get(&TypeId::of::<A>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<Repository<A>>>())
            .cloned()
            .ok_or_else(|| DispatchError::UnregisteredType(A::AGGREGATE_TYPE.to_string()).into())
    }

    /// Add an event subscriber at runtime.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionToken {
        self.events.subscribe(filter, subscriber)
    }

    /// Remove an event subscription; unknown tokens are a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.events.unsubscribe(token)
    }

    /// All command type keys the engine dispatches, sorted.
    pub fn registered_commands(&self) -> Vec<String> {
        self.commands.registered_keys()
    }
}

/// Deferred aggregate installation, run at build time against the
/// assembled bus and store.
type Installer = Box<
    dyn FnOnce(
            &CommandBus,
            &Arc<dyn EventStore>,
            SnapshotPolicy,
            &mut RepositoryMap,
        ) -> Result<(), EngineError>
        + Send,
>;

/// Builder for configuring and assembling an [`Engine`].
///
/// # Examples
///
/// ```no_run
/// use eventum::{Engine, MemoryStore, RoutingStrategy, SnapshotPolicy};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// # struct Counter;
/// # #[derive(Serialize, Deserialize)]
/// # #[serde(tag = "type", content = "data")]
/// # enum CounterCommand { Bump { counter_id: String } }
/// # #[derive(Clone, Serialize, Deserialize)]
/// # #[serde(tag = "type", content = "data")]
/// # enum CounterEvent { Bumped }
/// # impl eventum::Aggregate for Counter {
/// #     const AGGREGATE_TYPE: &'static str = "counter";
/// #     const COMMAND_TYPES: &'static [&'static str] = &["Bump"];
/// #     type Command = CounterCommand;
/// #     type DomainEvent = CounterEvent;
/// #     type Error = std::io::Error;
/// #     fn handle(&self, _: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> { Ok(vec![]) }
/// #     fn apply(self, _: &Self::DomainEvent) -> Self { self }
/// # }
///
/// let engine = Engine::builder()
///     .store(MemoryStore::new())
///     .snapshot_policy(SnapshotPolicy::every(50))
///     .aggregate::<Counter>(RoutingStrategy::by_field_index(0))
///     .build()
///     .expect("engine should assemble");
/// ```
pub struct EngineBuilder {
    store: Option<Arc<dyn EventStore>>,
    snapshots: SnapshotPolicy,
    validators: Vec<Arc<dyn FieldValidator>>,
    installers: Vec<Installer>,
    subscriptions: Vec<(EventFilter, Arc<dyn EventSubscriber>)>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// A builder with the default snapshot policy and an in-memory
    /// store unless one is supplied.
    pub fn new() -> Self {
        Self {
            store: None,
            snapshots: SnapshotPolicy::default(),
            validators: Vec::new(),
            installers: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Use the given storage backend.
    pub fn store(mut self, store: impl EventStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Use an already-shared storage backend.
    pub fn shared_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the snapshot cadence for every registered aggregate.
    ///
    /// Defaults to [`SnapshotPolicy::default`] (every 100 events).
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = policy;
        self
    }

    /// Add a field-level constraint validator to the validation gate.
    pub fn field_validator(mut self, validator: Arc<dyn FieldValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Register an aggregate type with its routing strategy.
    ///
    /// The aggregate's [`COMMAND_TYPES`](Aggregate::COMMAND_TYPES) are
    /// claimed on the command bus at build time; a collision with an
    /// already-claimed key fails `build()` with
    /// [`DispatchError::DuplicateHandler`].
    pub fn aggregate<A: Aggregate>(mut self, routing: RoutingStrategy) -> Self {
        self.installers.push(Box::new(
            move |commands: &CommandBus,
                  store: &Arc<dyn EventStore>,
                  snapshots: SnapshotPolicy,
                  repositories: &mut RepositoryMap| {
                let repository =
                    Arc::new(Repository::<A>::new(Arc::clone(store), routing, snapshots));
                commands.register(A::COMMAND_TYPES, repository.clone())?;
                repositories.insert(TypeId::of::<A>(), Box::new(repository));
                Ok(())
            },
        ));
        self
    }

    /// Register an aggregate type and verify its routing strategy
    /// against representative sample commands.
    ///
    /// Each sample is resolved through the strategy at build time, so a
    /// strategy that cannot extract an id for some command class fails
    /// setup rather than dispatch.
    pub fn aggregate_checked<A: Aggregate>(
        mut self,
        routing: RoutingStrategy,
        samples: Vec<A::Command>,
    ) -> Self {
        self.installers.push(Box::new(
            move |commands: &CommandBus,
                  store: &Arc<dyn EventStore>,
                  snapshots: SnapshotPolicy,
                  repositories: &mut RepositoryMap| {
                let mut payloads = Vec::with_capacity(samples.len());
                for sample in &samples {
                    let value =
                        serde_json::to_value(sample).map_err(crate::error::EnvelopeError::from)?;
                    let (_, payload) = split_tagged(&value)?;
                    payloads.push(payload);
                }
                routing.verify(payloads.iter())?;

                let repository =
                    Arc::new(Repository::<A>::new(Arc::clone(store), routing, snapshots));
                commands.register(A::COMMAND_TYPES, repository.clone())?;
                repositories.insert(TypeId::of::<A>(), Box::new(repository));
                Ok(())
            },
        ));
        self
    }

    /// Subscribe to the event feed from the start.
    pub fn subscribe(
        mut self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        self.subscriptions.push((filter, subscriber));
        self
    }

    /// Wire everything together.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::DuplicateHandler`] -- two aggregates claimed
    ///   the same command type key.
    /// * [`EngineError::Routing`] -- a checked routing strategy could
    ///   not resolve one of its sample commands.
    pub fn build(self) -> Result<Engine, EngineError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn EventStore>);

        let mut gate = ValidationGate::new();
        for validator in self.validators {
            gate = gate.with_validator(validator);
        }
        let commands = CommandBus::new(gate);

        let mut repositories = RepositoryMap::new();
        for installer in self.installers {
            installer(&commands, &store, self.snapshots, &mut repositories)?;
        }

        let events = EventBus::new();
        for (filter, subscriber) in self.subscriptions {
            events.subscribe(filter, subscriber);
        }

        tracing::debug!(
            commands = ?commands.registered_keys(),
            subscribers = events.subscriber_count(),
            "engine assembled"
        );

        Ok(Engine {
            commands: Arc::new(commands),
            events: Arc::new(events),
            repositories: Arc::new(repositories),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Wallet, WalletCommand};
    use crate::error::RoutingError;

    fn wallet_engine() -> Engine {
        Engine::builder()
            .store(MemoryStore::new())
            .snapshot_policy(SnapshotPolicy::Never)
            .aggregate::<Wallet>(RoutingStrategy::by_field_index(0))
            .build()
            .expect("engine should assemble")
    }

    #[tokio::test]
    async fn submit_command_accepts_and_loads_back() {
        let engine = wallet_engine();
        let submission = engine
            .submit_command::<Wallet>(
                &WalletCommand::Deposit {
                    wallet_id: "w-1".to_string(),
                    amount: 40,
                },
                ActorContext::new("u-1", "t-1"),
            )
            .await
            .expect("submit should succeed");

        assert!(submission.is_accepted());
        assert_eq!(submission.events().len(), 1);

        let (state, version) = engine
            .load::<Wallet>("w-1")
            .await
            .expect("load should succeed");
        assert_eq!(state.balance, 40);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn rejection_surfaces_as_submission_not_error() {
        let engine = wallet_engine();
        let submission = engine
            .submit_command::<Wallet>(
                &WalletCommand::Withdraw {
                    wallet_id: "w-1".to_string(),
                    amount: 5,
                },
                ActorContext::new("u-1", "t-1"),
            )
            .await
            .expect("submit should succeed");

        assert!(!submission.is_accepted());
        assert!(!submission.violations().is_empty());
    }

    #[test]
    fn duplicate_command_keys_fail_build() {
        // Registering the same aggregate type twice claims the same
        // command keys twice.
        let result = Engine::builder()
            .aggregate::<Wallet>(RoutingStrategy::by_field_index(0))
            .aggregate::<Wallet>(RoutingStrategy::by_field_index(0))
            .build();
        assert!(matches!(
            result,
            Err(EngineError::Dispatch(DispatchError::DuplicateHandler(_)))
        ));
    }

    #[test]
    fn checked_registration_verifies_samples() {
        let result = Engine::builder()
            .aggregate_checked::<Wallet>(
                RoutingStrategy::by_field_index(0),
                vec![
                    WalletCommand::Deposit {
                        wallet_id: "w-1".to_string(),
                        amount: 1,
                    },
                    WalletCommand::Withdraw {
                        wallet_id: "w-1".to_string(),
                        amount: 1,
                    },
                ],
            )
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn checked_registration_rejects_unroutable_strategy() {
        // Index 1 lands on `amount`, which is not an identifier field.
        let result = Engine::builder()
            .aggregate_checked::<Wallet>(
                RoutingStrategy::by_field_index(1),
                vec![WalletCommand::Deposit {
                    wallet_id: "w-1".to_string(),
                    amount: 1,
                }],
            )
            .build();
        assert!(matches!(
            result,
            Err(EngineError::Routing(RoutingError::TypeMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn load_of_unregistered_type_fails() {
        let engine = Engine::builder().build().expect("engine should assemble");
        let result = engine.load::<Wallet>("w-1").await;
        assert!(matches!(
            result,
            Err(EngineError::Dispatch(DispatchError::UnregisteredType(_)))
        ));
    }

    #[tokio::test]
    async fn engine_clone_shares_state() {
        let engine = wallet_engine();
        let clone = engine.clone();
        clone
            .submit_command::<Wallet>(
                &WalletCommand::Deposit {
                    wallet_id: "w-1".to_string(),
                    amount: 10,
                },
                ActorContext::new("u-1", "t-1"),
            )
            .await
            .expect("submit should succeed");

        let (state, _) = engine
            .load::<Wallet>("w-1")
            .await
            .expect("load should succeed");
        assert_eq!(state.balance, 10, "clones share the same store");
    }
}
