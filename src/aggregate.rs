//! Aggregate trait and the event-sourced root that tracks its lifecycle.

use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the
/// [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / business-rule error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no
///   I/O, no side effects. It validates a command against the current
///   state and returns zero or more events. Returning `Ok(vec![])` is a
///   designed no-op (nothing is persisted or published); returning `Err`
///   rejects the command and leaves state and version untouched.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. It can never fail for an event this
///   aggregate itself produced; a replay-time decode failure is treated
///   as corrupt history by the repository, not as a business error.
/// - Commands and events are adjacently tagged serde enums
///   (`#[serde(tag = "type", content = "data")]`); the tags are the type
///   keys the dispatch layer routes on, and
///   [`COMMAND_TYPES`](Aggregate::COMMAND_TYPES) must list every command
///   tag so the engine can claim them at registration time.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "wallet"). Used as the
    /// stream namespace and in log output.
    const AGGREGATE_TYPE: &'static str;

    /// The type keys (serde tags) of every command variant. The engine
    /// registers these on the command bus; a stale list means commands
    /// that never dispatch, so keep it in sync with `Command`.
    const COMMAND_TYPES: &'static [&'static str];

    /// The set of commands this aggregate can handle.
    type Command: Serialize + DeserializeOwned + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / business-rule error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    fn handle(&self, command: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Lifecycle of a loaded aggregate instance.
///
/// `Loading -> Idle` on restore, `Idle -> Handling -> Idle` around
/// command handling, `Idle -> Committing -> Idle` around the durable
/// append. Transitions are enforced with debug assertions: an illegal
/// transition is a programming error inside the engine, never a
/// recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// History is being fetched and replayed.
    Loading,
    /// At rest; no staged events.
    Idle,
    /// A command is being handled; events may be staged.
    Handling,
    /// Staged events are being appended to the durable log.
    Committing,
}

/// One loaded aggregate instance: identity, state, version, and the
/// events staged by the in-flight transaction.
///
/// Owned exclusively by the repository while loaded; never shared across
/// concurrent command handling for the same id. The id is immutable for
/// the root's lifetime, and `version` increases by exactly one per
/// applied event.
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    state: A,
    version: u64,
    uncommitted: Vec<A::DomainEvent>,
    lifecycle: Lifecycle,
}

// Manual `Debug` because `A::DomainEvent` need not be `Debug`; the
// staged event count is enough for diagnostics.
impl<A: Aggregate> std::fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("staged", &self.uncommitted.len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A root about to be restored: default state, version 0, `Loading`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: A::default(),
            version: 0,
            uncommitted: Vec::new(),
            lifecycle: Lifecycle::Loading,
        }
    }

    /// Finish loading: install the replayed state and version and move
    /// to `Idle`. For a brand-new id this is the default state at
    /// version 0.
    pub fn restore(&mut self, state: A, version: u64) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Loading);
        self.state = state;
        self.version = version;
        self.lifecycle = Lifecycle::Idle;
    }

    /// The instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Number of events folded into the state so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Where the instance is in its lifecycle.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Events staged by the in-flight transaction. Empty at rest.
    pub fn uncommitted(&self) -> &[A::DomainEvent] {
        &self.uncommitted
    }

    pub(crate) fn begin_handling(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Idle);
        self.lifecycle = Lifecycle::Handling;
    }

    pub(crate) fn finish_handling(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Handling);
        self.lifecycle = Lifecycle::Idle;
    }

    pub(crate) fn begin_commit(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Idle);
        self.lifecycle = Lifecycle::Committing;
    }

    pub(crate) fn finish_commit(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Committing);
        self.lifecycle = Lifecycle::Idle;
    }

    /// Fold one event into the state, bump the version, and stage it.
    /// Only legal while `Handling`.
    pub(crate) fn apply_staged(&mut self, event: A::DomainEvent) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Handling);
        self.state = std::mem::take(&mut self.state).apply(&event);
        self.version += 1;
        self.uncommitted.push(event);
    }

    /// Discard staged events and restore a prior `(state, version)`.
    /// Used by transaction rollback; returns the root to `Idle`.
    pub(crate) fn reset_to(&mut self, state: A, version: u64) {
        self.state = state;
        self.version = version;
        self.uncommitted.clear();
        self.lifecycle = Lifecycle::Idle;
    }

    /// Drain the staged events for persistence.
    pub(crate) fn take_uncommitted(&mut self) -> Vec<A::DomainEvent> {
        std::mem::take(&mut self.uncommitted)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{Wallet, WalletCommand, WalletError, WalletEvent};
    use super::*;

    #[test]
    fn handle_deposit_produces_event() {
        let wallet = Wallet::default();
        let events = wallet
            .handle(WalletCommand::Deposit {
                wallet_id: "w-1".to_string(),
                amount: 50,
            })
            .expect("deposit should succeed");
        assert_eq!(events, vec![WalletEvent::Deposited { amount: 50 }]);
    }

    #[test]
    fn handle_overdraw_is_rejected() {
        let wallet = Wallet { balance: 10 };
        let result = wallet.handle(WalletCommand::Withdraw {
            wallet_id: "w-1".to_string(),
            amount: 25,
        });
        assert!(
            matches!(
                result,
                Err(WalletError::InsufficientFunds {
                    balance: 10,
                    requested: 25
                })
            ),
            "expected InsufficientFunds, got: {result:?}"
        );
    }

    #[test]
    fn handle_reconcile_is_a_designed_noop() {
        let wallet = Wallet { balance: 5 };
        let events = wallet
            .handle(WalletCommand::Reconcile {
                wallet_id: "w-1".to_string(),
            })
            .expect("reconcile should succeed");
        assert!(events.is_empty());
    }

    #[test]
    fn apply_folds_events_into_state() {
        let wallet = Wallet::default()
            .apply(&WalletEvent::Deposited { amount: 100 })
            .apply(&WalletEvent::Withdrawn { amount: 30 });
        assert_eq!(wallet.balance, 70);
    }

    #[test]
    fn new_root_starts_loading_at_version_zero() {
        let root = AggregateRoot::<Wallet>::new("w-1");
        assert_eq!(root.id(), "w-1");
        assert_eq!(root.version(), 0);
        assert_eq!(root.lifecycle(), Lifecycle::Loading);
        assert!(root.uncommitted().is_empty());
    }

    #[test]
    fn restore_moves_to_idle() {
        let mut root = AggregateRoot::<Wallet>::new("w-1");
        root.restore(Wallet { balance: 40 }, 3);
        assert_eq!(root.lifecycle(), Lifecycle::Idle);
        assert_eq!(root.version(), 3);
        assert_eq!(root.state().balance, 40);
    }

    #[test]
    fn apply_staged_increments_version_once_per_event() {
        let mut root = AggregateRoot::<Wallet>::new("w-1");
        root.restore(Wallet::default(), 0);
        root.begin_handling();
        root.apply_staged(WalletEvent::Deposited { amount: 10 });
        root.apply_staged(WalletEvent::Deposited { amount: 5 });
        assert_eq!(root.version(), 2);
        assert_eq!(root.state().balance, 15);
        assert_eq!(root.uncommitted().len(), 2);
    }

    #[test]
    fn commit_cycle_clears_staging() {
        let mut root = AggregateRoot::<Wallet>::new("w-1");
        root.restore(Wallet::default(), 0);
        root.begin_handling();
        root.apply_staged(WalletEvent::Deposited { amount: 10 });
        root.finish_handling();

        root.begin_commit();
        let staged = root.take_uncommitted();
        root.finish_commit();

        assert_eq!(staged.len(), 1);
        assert!(root.uncommitted().is_empty(), "staging must be empty at rest");
        assert_eq!(root.lifecycle(), Lifecycle::Idle);
    }

    #[test]
    fn reset_to_discards_staged_work() {
        let mut root = AggregateRoot::<Wallet>::new("w-1");
        root.restore(Wallet { balance: 20 }, 2);
        root.begin_handling();
        root.apply_staged(WalletEvent::Withdrawn { amount: 20 });
        assert_eq!(root.version(), 3);

        root.reset_to(Wallet { balance: 20 }, 2);
        assert_eq!(root.version(), 2);
        assert_eq!(root.state().balance, 20);
        assert!(root.uncommitted().is_empty());
        assert_eq!(root.lifecycle(), Lifecycle::Idle);
    }
}
