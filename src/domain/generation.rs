//! Configuration generations — immutable, versioned snapshots of a node's
//! configuration payload.
//!
//! A generation is created when an operator push passes validation; its
//! payload and validation result are frozen from then on. Rollback re-targets
//! an earlier generation id, it never rewrites history.

use async_graphql::SimpleObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigGeneration {
    /// Monotonically increasing per node, assigned at acceptance time.
    pub id: u64,
    /// Opaque structured payload. Values are forwarded to the node, not
    /// interpreted, beyond the validated fields.
    pub payload: serde_json::Value,
    /// Validation outcome computed at submission time, frozen with the
    /// generation.
    pub validation: ValidationResult,
    pub created_at: DateTime<Utc>,
}

impl ConfigGeneration {
    pub fn new(id: u64, payload: serde_json::Value, validation: ValidationResult) -> Self {
        Self {
            id,
            payload,
            validation,
            created_at: Utc::now(),
        }
    }
}

/// Structured accept/reject result from the configuration validator.
///
/// Rejection never raises; it is always communicated as `accepted = false`
/// with a populated, ordered `errors` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub accepted: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            errors: Vec::new(),
        }
    }

    pub fn rejected(errors: Vec<FieldError>) -> Self {
        Self {
            accepted: false,
            errors,
        }
    }
}

/// One validation failure: the offending field path and the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Generation metadata without the payload, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct GenerationInfo {
    pub id: u64,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&ConfigGeneration> for GenerationInfo {
    fn from(generation: &ConfigGeneration) -> Self {
        Self {
            id: generation.id,
            accepted: generation.validation.accepted,
            created_at: generation.created_at,
        }
    }
}
