//! Generic unicast and multicast dispatch registries.
//!
//! Both registries are explicit data-driven lookup tables: a type key
//! maps to exactly one handler (unicast) or to any number of subscribers
//! (multicast). The tables are mutated during setup and read-mostly
//! during steady-state dispatch; handlers are stored as `Arc`s and cloned
//! out under the read guard so a lock is never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::DispatchError;

/// Exactly-one-handler registry, keyed by message type key.
///
/// Generic over the (usually unsized) handler type, e.g.
/// `UnicastBus<dyn CommandHandler>`.
pub struct UnicastBus<H: ?Sized> {
    handlers: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Default for UnicastBus<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> UnicastBus<H> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register one handler for every given type key.
    ///
    /// All-or-nothing: if any key is already taken the whole registration
    /// fails with [`DispatchError::DuplicateHandler`] and no key is
    /// registered. There is no silent override.
    pub fn register(&self, type_keys: &[&str], handler: Arc<H>) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write().expect("dispatch registry poisoned");
        if let Some(taken) = type_keys.iter().find(|key| handlers.contains_key(**key)) {
            return Err(DispatchError::DuplicateHandler(taken.to_string()));
        }
        for key in type_keys {
            handlers.insert(key.to_string(), Arc::clone(&handler));
        }
        Ok(())
    }

    /// Remove the registrations for the given type keys. Absent keys are
    /// a no-op.
    pub fn unregister(&self, type_keys: &[&str]) {
        let mut handlers = self.handlers.write().expect("dispatch registry poisoned");
        for key in type_keys {
            handlers.remove(*key);
        }
    }

    /// Look up the single handler for a type key.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnregisteredType`] if no handler is
    /// registered for the key.
    pub fn resolve(&self, type_key: &str) -> Result<Arc<H>, DispatchError> {
        self.handlers
            .read()
            .expect("dispatch registry poisoned")
            .get(type_key)
            .cloned()
            .ok_or_else(|| DispatchError::UnregisteredType(type_key.to_string()))
    }

    /// All registered type keys, sorted. Diagnostic helper.
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .read()
            .expect("dispatch registry poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// What a multicast subscription wants to receive.
///
/// An unset dimension matches everything; `EventFilter::any()` receives
/// the whole feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    type_keys: Option<HashSet<String>>,
    producers: Option<HashSet<String>>,
}

impl EventFilter {
    /// Match every message.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to the given type keys.
    pub fn for_type_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::any().with_type_keys(keys)
    }

    /// Restrict to the given producer ids.
    pub fn for_producers<I, S>(producers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::any().with_producers(producers)
    }

    /// Add a type-key restriction.
    pub fn with_type_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.type_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Add a producer-id restriction.
    pub fn with_producers<I, S>(mut self, producers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.producers = Some(producers.into_iter().map(Into::into).collect());
        self
    }

    /// Whether a message with this type key and producer passes.
    pub fn matches(&self, type_key: &str, producer: &str) -> bool {
        self.type_keys
            .as_ref()
            .is_none_or(|keys| keys.contains(type_key))
            && self
                .producers
                .as_ref()
                .is_none_or(|producers| producers.contains(producer))
    }
}

/// Opaque handle identifying one multicast subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscription<S: ?Sized> {
    token: SubscriptionToken,
    filter: EventFilter,
    subscriber: Arc<S>,
}

/// Any-number-of-subscribers registry with per-subscription filters.
///
/// Subscribing is an idempotent add: subscribing the same subscriber
/// value under the same filter returns the existing token. Delivery to
/// each recipient is independent; isolation of per-subscriber failures
/// is the caller's concern (see `EventBus::publish`).
pub struct MulticastBus<S: ?Sized> {
    subscriptions: RwLock<Vec<Subscription<S>>>,
    next_token: AtomicU64,
}

impl<S: ?Sized> Default for MulticastBus<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> MulticastBus<S> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Add a subscription; always succeeds.
    ///
    /// Re-subscribing the same subscriber (pointer identity) under an
    /// equal filter is idempotent and returns the original token.
    pub fn subscribe(&self, filter: EventFilter, subscriber: Arc<S>) -> SubscriptionToken {
        let mut subscriptions = self
            .subscriptions
            .write()
            .expect("subscription registry poisoned");
        if let Some(existing) = subscriptions
            .iter()
            .find(|s| Arc::ptr_eq(&s.subscriber, &subscriber) && s.filter == filter)
        {
            return existing.token;
        }
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        subscriptions.push(Subscription {
            token,
            filter,
            subscriber,
        });
        token
    }

    /// Remove a subscription. Returns whether one was removed; an
    /// unknown token is a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .expect("subscription registry poisoned");
        let before = subscriptions.len();
        subscriptions.retain(|s| s.token != token);
        subscriptions.len() != before
    }

    /// Every subscriber whose filter matches, with its token, cloned out
    /// under the read guard in subscription order.
    pub fn recipients(&self, type_key: &str, producer: &str) -> Vec<(SubscriptionToken, Arc<S>)> {
        self.subscriptions
            .read()
            .expect("subscription registry poisoned")
            .iter()
            .filter(|s| s.filter.matches(type_key, producer))
            .map(|s| (s.token, Arc::clone(&s.subscriber)))
            .collect()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription registry poisoned")
            .len()
    }

    /// Whether there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
