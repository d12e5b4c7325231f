//! Scoped, rollback-capable staging for one command-handling cycle.

use crate::aggregate::{Aggregate, AggregateRoot};

/// A staging context bound to exactly one load-handle-commit cycle.
///
/// `begin` snapshots the starting `(state, version)`; every
/// [`apply`](Transaction::apply) folds an event into the root and stages
/// it without touching durable storage. [`commit`](Transaction::commit)
/// returns the final `(state, version, staged events)` atomically;
/// [`rollback`](Transaction::rollback) restores the starting point
/// wholesale. Dropping an unfinished transaction rolls back, so a
/// handler that errors out part-way can never leak staged events.
///
/// Staged events are visible only to the repository's persistence step,
/// never to other readers. The repository's per-id lock guarantees two
/// transactions for the same aggregate id are never open concurrently.
pub struct Transaction<'a, A: Aggregate> {
    root: &'a mut AggregateRoot<A>,
    origin_state: A,
    origin_version: u64,
    finished: bool,
}

impl<'a, A: Aggregate> Transaction<'a, A> {
    /// Open a transaction on an idle root, recording its current
    /// `(state, version)` for rollback.
    pub fn begin(root: &'a mut AggregateRoot<A>) -> Self {
        let origin_state = root.state().clone();
        let origin_version = root.version();
        root.begin_handling();
        Self {
            root,
            origin_state,
            origin_version,
            finished: false,
        }
    }

    /// The state as of the latest applied event.
    pub fn state(&self) -> &A {
        self.root.state()
    }

    /// The version as of the latest applied event.
    pub fn version(&self) -> u64 {
        self.root.version()
    }

    /// Fold one produced event into the state and stage it.
    pub fn apply(&mut self, event: A::DomainEvent) {
        self.root.apply_staged(event);
    }

    /// Close the transaction, returning the final state, version, and
    /// staged events for persistence. The root returns to idle with an
    /// empty staging list.
    pub fn commit(mut self) -> (A, u64, Vec<A::DomainEvent>) {
        self.finished = true;
        self.root.finish_handling();
        let staged = self.root.take_uncommitted();
        (self.root.state().clone(), self.root.version(), staged)
    }

    /// Discard all staged events and restore the starting
    /// `(state, version)`.
    pub fn rollback(mut self) {
        self.finished = true;
        let origin_state = std::mem::take(&mut self.origin_state);
        self.root.reset_to(origin_state, self.origin_version);
    }
}

impl<A: Aggregate> Drop for Transaction<'_, A> {
    fn drop(&mut self) {
        if !self.finished {
            let origin_state = std::mem::take(&mut self.origin_state);
            self.root.reset_to(origin_state, self.origin_version);
        }
    }
}
