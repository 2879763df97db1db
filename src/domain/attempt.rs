//! Reconciliation attempts — units of work driving one node toward its
//! desired state. Owned exclusively by the reconciliation engine.

use async_graphql::{Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::{NodeId, RunState};

/// The corrective operation an attempt performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WorkKind {
    ApplyConfiguration { generation: u64 },
    SetRunState { desired: RunState },
    Restart,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplyConfiguration { generation } => {
                write!(f, "apply_configuration(gen {generation})")
            }
            Self::SetRunState { desired } => write!(f, "set_run_state({desired})"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

/// Attempt lifecycle. `Succeeded`, `Failed` and `Superseded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    InProgress,
    RetryScheduled,
    Succeeded,
    Failed,
    Superseded,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Superseded)
    }
}

/// One reconciliation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub node: NodeId,
    pub kind: WorkKind,
    pub state: AttemptState,
    /// Remote tries performed so far (including the one in flight).
    pub tries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(node: NodeId, kind: WorkKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            node,
            kind,
            state: AttemptState::Pending,
            tries: 0,
            last_error: None,
            next_retry_at: None,
            enqueued_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Attempt summary for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct AttemptView {
    pub id: String,
    pub operation: String,
    pub state: AttemptState,
    pub tries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Attempt> for AttemptView {
    fn from(attempt: &Attempt) -> Self {
        Self {
            id: attempt.id.to_string(),
            operation: attempt.kind.to_string(),
            state: attempt.state,
            tries: attempt.tries,
            last_error: attempt.last_error.clone(),
            next_retry_at: attempt.next_retry_at,
            enqueued_at: attempt.enqueued_at,
            finished_at: attempt.finished_at,
        }
    }
}
