//! Configuration validator — a pure function over a configuration payload.
//!
//! The rule set is data: a list of field rules checked in declaration order,
//! plus cross-field rules. The same schema runs centrally at submission time
//! and on the node before activation. Deterministic, no I/O; rejection is a
//! populated error list, never an error return.

use serde_json::Value;

use crate::domain::generation::{FieldError, ValidationResult};

/// Expected shape of one payload field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A string; optionally required to be non-empty after trimming.
    Text { non_empty: bool },
    /// A number constrained to an inclusive range.
    Number { min: f64, max: f64 },
    /// An integer constrained to an inclusive range.
    Integer { min: i64, max: i64 },
}

/// One declared field: dot-separated path, expected kind, and whether the
/// field must be present at all.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub path: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldRule {
    pub const fn required(path: &'static str, kind: FieldKind) -> Self {
        Self {
            path,
            kind,
            required: true,
        }
    }

    pub const fn optional(path: &'static str, kind: FieldKind) -> Self {
        Self {
            path,
            kind,
            required: false,
        }
    }
}

/// Cross-field consistency: when `if_present` exists, `then_non_empty` must
/// be a non-empty string.
#[derive(Debug, Clone)]
pub struct CrossRule {
    pub if_present: &'static str,
    pub then_non_empty: &'static str,
}

/// Declared payload schema: field rules plus cross-field rules, checked in
/// declaration order so rejection output is stable.
#[derive(Debug, Clone)]
pub struct ValidationSchema {
    pub fields: Vec<FieldRule>,
    pub cross: Vec<CrossRule>,
}

impl Default for ValidationSchema {
    fn default() -> Self {
        Self {
            fields: vec![
                FieldRule::required("agent.name", FieldKind::Text { non_empty: true }),
                FieldRule::required("agent.command", FieldKind::Text { non_empty: true }),
                FieldRule::optional("agent.welcome_message", FieldKind::Text { non_empty: false }),
                FieldRule::required("llm.provider", FieldKind::Text { non_empty: true }),
                FieldRule::optional("llm.temperature", FieldKind::Number { min: 0.0, max: 2.0 }),
                FieldRule::required(
                    "telephony.phone_number",
                    FieldKind::Text { non_empty: true },
                ),
                FieldRule::optional(
                    "telephony.sip_trunk_uri",
                    FieldKind::Text { non_empty: false },
                ),
                FieldRule::required(
                    "credentials.api_key_ref",
                    FieldKind::Text { non_empty: true },
                ),
                FieldRule::optional("api.port", FieldKind::Integer { min: 1, max: 65535 }),
            ],
            cross: vec![CrossRule {
                if_present: "telephony.sip_trunk_uri",
                then_non_empty: "telephony.sip_username",
            }],
        }
    }
}

/// Validate a payload against a schema.
pub fn validate(payload: &Value, schema: &ValidationSchema) -> ValidationResult {
    let mut errors = Vec::new();

    if !payload.is_object() {
        errors.push(FieldError::new("", "payload must be a JSON object"));
        return ValidationResult::rejected(errors);
    }

    for rule in &schema.fields {
        match lookup(payload, rule.path) {
            None => {
                if rule.required {
                    errors.push(FieldError::new(rule.path, "required field is missing"));
                }
            }
            Some(value) => check_kind(rule.path, value, &rule.kind, &mut errors),
        }
    }

    for rule in &schema.cross {
        if lookup(payload, rule.if_present).is_some() {
            let ok = matches!(
                lookup(payload, rule.then_non_empty),
                Some(Value::String(s)) if !s.trim().is_empty()
            );
            if !ok {
                errors.push(FieldError::new(
                    rule.then_non_empty,
                    format!("must be a non-empty string when {} is set", rule.if_present),
                ));
            }
        }
    }

    if errors.is_empty() {
        ValidationResult::accepted()
    } else {
        ValidationResult::rejected(errors)
    }
}

fn check_kind(path: &str, value: &Value, kind: &FieldKind, errors: &mut Vec<FieldError>) {
    match kind {
        FieldKind::Text { non_empty } => match value {
            Value::String(s) => {
                if *non_empty && s.trim().is_empty() {
                    errors.push(FieldError::new(path, "must not be empty"));
                }
            }
            _ => errors.push(FieldError::new(path, "must be a string")),
        },
        FieldKind::Number { min, max } => match value.as_f64() {
            Some(n) if n >= *min && n <= *max => {}
            Some(n) => errors.push(FieldError::new(
                path,
                format!("value {n} is outside the range [{min}, {max}]"),
            )),
            None => errors.push(FieldError::new(path, "must be a number")),
        },
        FieldKind::Integer { min, max } => match value.as_i64() {
            Some(n) if n >= *min && n <= *max => {}
            Some(n) => errors.push(FieldError::new(
                path,
                format!("value {n} is outside the range [{min}, {max}]"),
            )),
            None => errors.push(FieldError::new(path, "must be an integer")),
        },
    }
}

/// Resolve a dot-separated path inside a JSON object tree.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
