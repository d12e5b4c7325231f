//! Pre-dispatch validation of command envelopes.
//!
//! The gate runs every check and accumulates violations rather than
//! failing fast, so a submitter sees every problem in one report.
//! Violations are plain data; they are never raised as control flow.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

/// One failed constraint, reported as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Human-readable description of the failed rule.
    pub message: String,
    /// Path of the offending field, when the violation is field-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The offending value, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ConstraintViolation {
    /// An envelope-scoped violation.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            value: None,
        }
    }

    /// A field-scoped violation carrying the offending value.
    pub fn on_field(
        message: impl Into<String>,
        field: impl Into<String>,
        value: Option<Value>,
    ) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
            value,
        }
    }
}

impl std::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "field '{field}': {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// External field-level constraint checker (collaborator).
///
/// Treated as an opaque pure function over the message payload; the gate
/// merges its output with the structural checks. Closures of the matching
/// shape implement it directly.
pub trait FieldValidator: Send + Sync {
    /// Check the payload's fields, returning every violation found.
    fn validate_fields(&self, payload: &Value) -> Vec<ConstraintViolation>;
}

impl<F> FieldValidator for F
where
    F: Fn(&Value) -> Vec<ConstraintViolation> + Send + Sync,
{
    fn validate_fields(&self, payload: &Value) -> Vec<ConstraintViolation> {
        self(payload)
    }
}

/// Structural and business-rule checks run before dispatch.
///
/// An envelope with zero violations is dispatched; otherwise dispatch is
/// refused and the violation list is the caller-visible result.
#[derive(Clone, Default)]
pub struct ValidationGate {
    validators: Vec<Arc<dyn FieldValidator>>,
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl ValidationGate {
    /// A gate with only the structural checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field-level constraint validator.
    pub fn with_validator(mut self, validator: Arc<dyn FieldValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Run every check, in order, accumulating all violations:
    ///
    /// 1. the envelope id is non-nil,
    /// 2. the payload is non-default (a non-empty type key),
    /// 3. the actor context is non-default,
    /// 4. every registered field validator passes,
    /// 5. any identifier-convention field present in the payload is
    ///    non-empty.
    pub fn validate(&self, envelope: &Envelope) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();

        if envelope.id().is_nil() {
            violations.push(ConstraintViolation::new("envelope id is nil"));
        }

        if envelope.type_key().is_empty() {
            violations.push(ConstraintViolation::new(
                "payload is default: empty type key",
            ));
        }

        let context = envelope.context();
        if context.actor_id.is_empty() {
            violations.push(ConstraintViolation::new("actor context has no actor id"));
        }
        if context.tenant_id.is_empty() {
            violations.push(ConstraintViolation::new("actor context has no tenant id"));
        }

        for validator in &self.validators {
            violations.extend(validator.validate_fields(envelope.payload()));
        }

        if let Some(obj) = envelope.payload().as_object() {
            for (name, value) in obj {
                if (name == "id" || name.ends_with("_id"))
                    && value.as_str().is_some_and(str::is_empty)
                {
                    violations.push(ConstraintViolation::on_field(
                        "target id is empty",
                        name.clone(),
                        Some(value.clone()),
                    ));
                }
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ActorContext;
    use serde_json::json;
    use uuid::Uuid;

    fn valid_envelope() -> Envelope {
        Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::new("u-1", "t-1"),
            "Deposit",
            json!({"wallet_id": "w-1", "amount": 5}),
        )
    }

    #[test]
    fn valid_envelope_passes_clean() {
        let gate = ValidationGate::new();
        let violations = gate.validate(&valid_envelope());
        assert!(violations.is_empty(), "got: {violations:?}");
    }

    #[test]
    fn nil_id_is_a_violation() {
        let env = Envelope::from_parts(
            Uuid::nil(),
            ActorContext::new("u-1", "t-1"),
            "Deposit",
            json!({"wallet_id": "w-1"}),
        );
        let violations = ValidationGate::new().validate(&env);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("nil"));
    }

    #[test]
    fn violations_accumulate_rather_than_fail_fast() {
        // Nil id, empty type key, and a fully default context: every
        // structural check fires in one pass.
        let env = Envelope::from_parts(Uuid::nil(), ActorContext::default(), "", Value::Null);
        let violations = ValidationGate::new().validate(&env);
        assert_eq!(
            violations.len(),
            4,
            "all structural checks must report, got: {violations:?}"
        );
    }

    #[test]
    fn default_context_is_two_violations() {
        let env = Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::default(),
            "Deposit",
            json!({"wallet_id": "w-1"}),
        );
        let violations = ValidationGate::new().validate(&env);
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn field_validators_are_merged() {
        let gate = ValidationGate::new()
            .with_validator(Arc::new(|payload: &Value| {
                match payload.get("amount").and_then(Value::as_i64) {
                    Some(n) if n <= 0 => vec![ConstraintViolation::on_field(
                        "amount must be positive",
                        "amount",
                        Some(json!(n)),
                    )],
                    _ => Vec::new(),
                }
            }))
            .with_validator(Arc::new(|payload: &Value| {
                if payload.get("memo").is_some() {
                    vec![ConstraintViolation::on_field(
                        "memo is not allowed",
                        "memo",
                        None,
                    )]
                } else {
                    Vec::new()
                }
            }));

        let env = Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::new("u-1", "t-1"),
            "Deposit",
            json!({"wallet_id": "w-1", "amount": -3, "memo": "hi"}),
        );
        let violations = gate.validate(&env);
        assert_eq!(violations.len(), 2, "got: {violations:?}");
        assert_eq!(violations[0].field.as_deref(), Some("amount"));
        assert_eq!(violations[1].field.as_deref(), Some("memo"));
    }

    #[test]
    fn empty_target_id_field_is_a_violation() {
        let env = Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::new("u-1", "t-1"),
            "Deposit",
            json!({"wallet_id": "", "amount": 5}),
        );
        let violations = ValidationGate::new().validate(&env);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field.as_deref(), Some("wallet_id"));
    }

    #[test]
    fn absent_target_id_field_is_not_checked_here() {
        // Check 5 only applies when an identifier field is present;
        // absence is the routing layer's concern.
        let env = Envelope::from_parts(
            Uuid::new_v4(),
            ActorContext::new("u-1", "t-1"),
            "Ping",
            Value::Null,
        );
        let violations = ValidationGate::new().validate(&env);
        assert!(violations.is_empty());
    }

    #[test]
    fn violation_display_includes_field() {
        let v = ConstraintViolation::on_field("must be positive", "amount", None);
        assert_eq!(v.to_string(), "field 'amount': must be positive");
        let v = ConstraintViolation::new("context is empty");
        assert_eq!(v.to_string(), "context is empty");
    }

    #[test]
    fn violation_serde_roundtrip() {
        let v = ConstraintViolation::on_field("bad", "x", Some(json!(1)));
        let json = serde_json::to_string(&v).expect("serialize should succeed");
        let back: ConstraintViolation =
            serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, v);
    }
}
