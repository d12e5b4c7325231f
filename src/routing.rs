//! Routing strategies that extract a target entity id from a message.
//!
//! The command bus delivers an envelope to the one handler registered for
//! its type key; the handler (an aggregate repository) then needs the
//! entity instance the command addresses. A [`RoutingStrategy`] is the
//! rule that extracts that id from the message payload and actor context.
//!
//! Strategies must be pure and total over every message class registered
//! against them. [`RoutingStrategy::verify`] checks representative sample
//! payloads at registration time so a strategy that cannot resolve an id
//! fails setup, not dispatch.

use std::sync::Arc;

use serde_json::Value;

use crate::envelope::ActorContext;
use crate::error::RoutingError;

/// Mapping function for [`RoutingStrategy::by_custom`]. Total by
/// construction: it must return an id for every registered message.
pub type RouteFn = dyn Fn(&Value, &ActorContext) -> String + Send + Sync;

/// The rule that extracts a target entity id from a message.
#[derive(Clone)]
pub enum RoutingStrategy {
    /// Extract the n-th field (declaration order) of the message payload.
    ///
    /// The field must follow the identifier naming convention (`id` or
    /// `*_id`) and hold a non-empty string.
    FieldIndex(usize),

    /// Delegate entirely to a caller-supplied mapping over the payload
    /// and actor context.
    Custom(Arc<RouteFn>),
}

// Manual Debug: the custom mapping is an opaque closure.
impl std::fmt::Debug for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FieldIndex(n) => f.debug_tuple("FieldIndex").field(n).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Whether a field name denotes an identifier by naming convention.
fn is_identifier_field(name: &str) -> bool {
    name == "id" || name.ends_with("_id")
}

/// JSON type name for diagnostics.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl RoutingStrategy {
    /// Route on the n-th payload field, which by naming convention must
    /// be an identifier.
    pub fn by_field_index(index: usize) -> Self {
        Self::FieldIndex(index)
    }

    /// Route through a supplied `(payload, context) -> id` mapping.
    pub fn by_custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &ActorContext) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Extract the target entity id from a message payload.
    ///
    /// # Errors
    ///
    /// * [`RoutingError::MissingEntityId`] -- the payload is not an
    ///   object, has no field at the index, or the field is empty.
    /// * [`RoutingError::TypeMismatch`] -- the field is not named like an
    ///   identifier or does not hold a string.
    pub fn resolve(
        &self,
        payload: &Value,
        context: &ActorContext,
    ) -> Result<String, RoutingError> {
        match self {
            Self::Custom(f) => Ok(f(payload, context)),
            Self::FieldIndex(index) => {
                let obj = payload
                    .as_object()
                    .ok_or(RoutingError::MissingEntityId { index: *index })?;
                let (name, value) = obj
                    .iter()
                    .nth(*index)
                    .ok_or(RoutingError::MissingEntityId { index: *index })?;
                if !is_identifier_field(name) {
                    return Err(RoutingError::TypeMismatch {
                        field: name.clone(),
                        expected: "identifier-named field (`id` or `*_id`)",
                        found: format!("field named '{name}'"),
                    });
                }
                let id = value.as_str().ok_or_else(|| RoutingError::TypeMismatch {
                    field: name.clone(),
                    expected: "string",
                    found: json_type_name(value).to_string(),
                })?;
                if id.is_empty() {
                    return Err(RoutingError::MissingEntityId { index: *index });
                }
                Ok(id.to_string())
            }
        }
    }

    /// Check the strategy against representative sample payloads.
    ///
    /// Called at registration time so a strategy that cannot resolve an
    /// id for some registered message class fails setup rather than
    /// dispatch. Custom mappings are total by construction and pass
    /// trivially.
    ///
    /// # Errors
    ///
    /// The first [`RoutingError`] produced by any sample.
    pub fn verify<'a>(
        &self,
        samples: impl IntoIterator<Item = &'a Value>,
    ) -> Result<(), RoutingError> {
        if matches!(self, Self::Custom(_)) {
            return Ok(());
        }
        let probe_context = ActorContext::default();
        for sample in samples {
            self.resolve(sample, &probe_context)?;
        }
        Ok(())
    }
}
