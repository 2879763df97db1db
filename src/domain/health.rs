//! Health samples and classification.
//!
//! Samples are append-only evidence collected from node supervisors. The
//! classification (healthy/degraded/unreachable) is derived from a sliding
//! window of recent samples by the health aggregator, never stored.

use async_graphql::{Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::{NodeId, RunState};

/// Point-in-time observation of a node, produced by its supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct HealthSample {
    pub node_id: NodeId,
    pub taken_at: DateTime<Utc>,
    pub run_state: RunState,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime_secs: u64,
    pub restart_count: u32,
    /// Generation the node reports as currently active.
    pub active_generation: Option<u64>,
    /// Set when the supervised process exited unexpectedly or failed to spawn.
    pub error: bool,
    pub error_message: Option<String>,
}

/// Derived node health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for HealthClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// A finite, restartable slice of a node's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub lines: Vec<String>,
    /// Byte cursor to resume from on the next request.
    pub next_cursor: u64,
}
