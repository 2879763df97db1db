//! Error taxonomy for the control plane and the supervisor protocol.
//!
//! Registry and validation errors are synchronous and surface directly to the
//! caller. Supervisor errors split into transport failures (retryable) and
//! application rejections (fatal for the attempt that hit them).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::node::NodeId;
use crate::store::StoreError;

/// Synchronous registry-level failures, mapped 1:1 onto control API statuses.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(NodeId),

    #[error("unknown node '{0}'")]
    UnknownNode(NodeId),

    #[error("node '{node}' is not fully stopped: {detail}")]
    NodePreconditionFailed { node: NodeId, detail: String },

    #[error("node '{node}' has no configuration generation {generation}")]
    UnknownGeneration { node: NodeId, generation: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Stable error code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateNode(_) => "duplicate_node",
            Self::UnknownNode(_) => "unknown_node",
            Self::NodePreconditionFailed { .. } => "node_precondition_failed",
            Self::UnknownGeneration { .. } => "unknown_generation",
            Self::Store(_) => "store_error",
        }
    }
}

/// Failures crossing the supervisor protocol boundary.
///
/// The distinction drives the reconciliation state machine: `Transport` goes
/// to `retry_scheduled`, `Rejected` goes straight to `failed`.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected by node ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl SupervisorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Structured error body shared by the control API and the supervisor API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
