//! The Command Bus and Event Bus: named wirings of the dispatch registries.
//!
//! The command bus is the unicast flavor with a validation gate in
//! front: an envelope with violations is refused before any handler
//! sees it, and each type key has exactly one handler (normally an
//! aggregate repository). The event bus is the multicast flavor: any
//! number of subscribers, delivery isolated per subscriber, failures
//! reported but never propagated to other subscribers or the publisher.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{EventFilter, MulticastBus, SubscriptionToken, UnicastBus};
use crate::envelope::Envelope;
use crate::error::{DispatchError, EngineError};
use crate::event::EventEnvelope;
use crate::validation::ValidationGate;

/// The single handler a command's type key resolves to.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one validated command envelope, returning the committed
    /// events for publication.
    ///
    /// # Errors
    ///
    /// [`EngineError::Rejected`] for business-rule refusals; other
    /// variants for infrastructure failures.
    async fn handle_command(&self, envelope: &Envelope) -> Result<Vec<EventEnvelope>, EngineError>;
}

/// Error a subscriber may surface; reported, never retried.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// A recipient of committed events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Consume one committed event.
    async fn receive(&self, event: &EventEnvelope) -> Result<(), SubscriberError>;
}

/// Unicast command dispatch behind the validation gate.
pub struct CommandBus {
    gate: ValidationGate,
    registry: UnicastBus<dyn CommandHandler>,
}

impl CommandBus {
    /// A bus that refuses envelopes the gate objects to.
    pub fn new(gate: ValidationGate) -> Self {
        Self {
            gate,
            registry: UnicastBus::new(),
        }
    }

    /// Register one handler for every given command type key.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateHandler`] if any key is already taken;
    /// nothing is registered in that case.
    pub fn register(
        &self,
        type_keys: &[&str],
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DispatchError> {
        tracing::debug!(keys = ?type_keys, "registering command handler");
        self.registry.register(type_keys, handler)
    }

    /// Remove the registrations for the given type keys.
    pub fn unregister(&self, type_keys: &[&str]) {
        self.registry.unregister(type_keys);
    }

    /// All registered command type keys, sorted.
    pub fn registered_keys(&self) -> Vec<String> {
        self.registry.registered_keys()
    }

    /// Validate and dispatch one command envelope to its single handler.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Rejected`] -- the gate found violations, or the
    ///   handler refused the command on business grounds.
    /// * [`EngineError::Dispatch`] -- no handler for the type key.
    /// * Storage and history errors from the handler pass through.
    pub async fn post(&self, envelope: &Envelope) -> Result<Vec<EventEnvelope>, EngineError> {
        let violations = self.gate.validate(envelope);
        if !violations.is_empty() {
            tracing::debug!(
                type_key = envelope.type_key(),
                count = violations.len(),
                "envelope refused by validation gate"
            );
            return Err(EngineError::Rejected { violations });
        }

        let handler = self.registry.resolve(envelope.type_key())?;
        handler.handle_command(envelope).await
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("registered", &self.registry.registered_keys())
            .finish()
    }
}

/// One subscriber's failure during a publish.
#[derive(Debug, Clone)]
pub struct SubscriberFailure {
    /// Which subscription failed.
    pub token: SubscriptionToken,
    /// The subscriber's error, rendered.
    pub error: String,
}

/// Outcome of publishing one or more events to the event bus.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Number of successful deliveries.
    pub delivered: usize,
    /// Every failed delivery; failures never block other subscribers.
    pub failures: Vec<SubscriberFailure>,
}

impl PublishReport {
    /// Fold another report into this one.
    fn merge(&mut self, other: PublishReport) {
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

/// Multicast fan-out of committed events.
#[derive(Default)]
pub struct EventBus {
    registry: MulticastBus<dyn EventSubscriber>,
}

impl EventBus {
    /// A bus with no subscribers; publishing to it succeeds trivially.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber for the events matching `filter`.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionToken {
        self.registry.subscribe(filter, subscriber)
    }

    /// Remove a subscription; unknown tokens are a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.registry.unsubscribe(token)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Deliver one event to every matching subscriber.
    ///
    /// Per-subscriber failures are collected into the report and logged;
    /// they do not prevent delivery to the remaining subscribers and are
    /// not retried.
    pub async fn publish(&self, event: &EventEnvelope) -> PublishReport {
        let mut report = PublishReport::default();
        let recipients = self
            .registry
            .recipients(event.type_key(), &event.producer().instance_id);

        for (token, subscriber) in recipients {
            match subscriber.receive(event).await {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    tracing::error!(
                        type_key = event.type_key(),
                        producer = %event.producer(),
                        %error,
                        "event subscriber failed"
                    );
                    report.failures.push(SubscriberFailure {
                        token,
                        error: error.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Publish a batch in production order, merging the reports.
    pub async fn publish_all(&self, events: &[EventEnvelope]) -> PublishReport {
        let mut report = PublishReport::default();
        for event in events {
            report.merge(self.publish(event).await);
        }
        report
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.registry.len())
            .finish()
    }
}
