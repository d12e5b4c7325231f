//! Message envelopes and the actor context they carry.
//!
//! An [`Envelope`] wraps one decoded message (a command or an event
//! payload) together with its identity, the issuing actor's context, and
//! the type key the dispatch layer routes on. Envelopes are immutable
//! once constructed.
//!
//! Messages are adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`); the `"type"` tag becomes
//! the envelope's type key and the `"data"` portion becomes its payload.

use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EnvelopeError;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .expect("system clock is before Unix epoch")
        .as_millis() as u64
}

/// Identity and tenancy of the caller issuing a message.
///
/// A default (empty) context is invalid for dispatch: the validation
/// gate refuses any envelope whose context has an empty actor or tenant.
///
/// # Examples
///
/// ```
/// use eventum::ActorContext;
///
/// let ctx = ActorContext::new("user-42", "acme");
/// assert_eq!(ctx.actor_id, "user-42");
/// assert_eq!(ctx.tenant_id, "acme");
/// assert!(ctx.timestamp_ms > 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Identity of the actor issuing the message (e.g. a user id).
    pub actor_id: String,
    /// Tenant the actor operates under.
    pub tenant_id: String,
    /// Milliseconds since the Unix epoch at which the context was built.
    pub timestamp_ms: u64,
}

impl ActorContext {
    /// Build a context for the given actor and tenant, stamped with the
    /// current wall-clock time.
    pub fn new(actor_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: tenant_id.into(),
            timestamp_ms: epoch_millis(),
        }
    }

    /// Replace the actor identity.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Replace the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Whether this context is indistinguishable from `Default::default()`
    /// in the fields that matter for dispatch.
    pub fn is_default(&self) -> bool {
        self.actor_id.is_empty() || self.tenant_id.is_empty()
    }
}

/// An identifiable, context-carrying wrapper around one typed message.
///
/// The payload is held as the `"data"` portion of the adjacently tagged
/// message; the tag itself is the [`type_key`](Envelope::type_key) used
/// for routing and dispatch. Use [`payload_as`](Envelope::payload_as) to
/// recover the typed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    context: ActorContext,
    type_key: String,
    payload: Value,
}

impl Envelope {
    /// Wrap a message in a new envelope with a fresh v4 id.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidEnvelope`] if the actor context is
    /// default/empty or the message does not serialize to an adjacently
    /// tagged object, and [`EnvelopeError::Codec`] if serialization fails.
    pub fn enclose<M: Serialize>(
        context: ActorContext,
        message: &M,
    ) -> Result<Self, EnvelopeError> {
        Self::enclose_with_id(Uuid::new_v4(), context, message)
    }

    /// Wrap a message in a new envelope under a caller-supplied id.
    ///
    /// # Errors
    ///
    /// As [`enclose`](Envelope::enclose), plus
    /// [`EnvelopeError::InvalidEnvelope`] if `id` is the nil UUID.
    pub fn enclose_with_id<M: Serialize>(
        id: Uuid,
        context: ActorContext,
        message: &M,
    ) -> Result<Self, EnvelopeError> {
        if id.is_nil() {
            return Err(EnvelopeError::InvalidEnvelope(
                "envelope id is nil".to_string(),
            ));
        }
        if context.is_default() {
            return Err(EnvelopeError::InvalidEnvelope(
                "actor context is default/empty".to_string(),
            ));
        }
        let value = serde_json::to_value(message)?;
        let (type_key, payload) = split_tagged(&value)?;
        Ok(Self {
            id,
            context,
            type_key,
            payload,
        })
    }

    /// Assemble an envelope from already-separated parts without checks.
    ///
    /// Used when rehydrating persisted records and in tests; the
    /// validation gate still inspects envelopes built this way.
    pub fn from_parts(
        id: Uuid,
        context: ActorContext,
        type_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id,
            context,
            type_key: type_key.into(),
            payload,
        }
    }

    /// The envelope's unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The actor context the message was issued under.
    pub fn context(&self) -> &ActorContext {
        &self.context
    }

    /// The dispatch/routing key, derived once from the message's tag.
    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    /// The `"data"` portion of the message. `Value::Null` for messages
    /// with no fields.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Reconstruct the typed message from the stored tag and payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Codec`] if the payload no longer matches
    /// the target type.
    pub fn payload_as<M: DeserializeOwned>(&self) -> Result<M, EnvelopeError> {
        Ok(serde_json::from_value(join_tagged(
            &self.type_key,
            &self.payload,
        ))?)
    }
}

/// Split an adjacently tagged message value into `(tag, data)`.
///
/// The `"data"` field is absent for fieldless variants, in which case the
/// payload is `Value::Null`.
pub(crate) fn split_tagged(value: &Value) -> Result<(String, Value), EnvelopeError> {
    let obj = value.as_object().ok_or_else(|| {
        EnvelopeError::InvalidEnvelope(format!(
            "message must be an adjacently tagged object, got {value}"
        ))
    })?;
    let tag = obj
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EnvelopeError::InvalidEnvelope(
                "message has no non-empty 'type' tag".to_string(),
            )
        })?;
    let payload = obj.get("data").cloned().unwrap_or(Value::Null);
    Ok((tag.to_string(), payload))
}

/// Rebuild the adjacently tagged form from a tag and payload.
pub(crate) fn join_tagged(type_key: &str, payload: &Value) -> Value {
    if payload.is_null() {
        serde_json::json!({ "type": type_key })
    } else {
        serde_json::json!({ "type": type_key, "data": payload })
    }
}
