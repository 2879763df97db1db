//! Remote agent supervisor — the capability interface the core consumes.
//!
//! The reconciliation engine and health poller only ever see this trait; the
//! HTTP client in [`client`] implements it against a node-side daemon, and
//! tests implement it with scripted in-memory fakes. All four operations are
//! idempotent at the node.

pub mod client;
pub mod process;
pub mod server;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::generation::ConfigGeneration;
use crate::domain::health::{HealthSample, LogChunk};
use crate::domain::node::{Node, RunState};
use crate::error::SupervisorError;

/// The four supervisor operations.
#[async_trait]
pub trait AgentSupervisor: Send + Sync {
    /// Activate a configuration generation. Applying an already-active
    /// generation id is a no-op success.
    async fn apply_configuration(
        &self,
        generation: &ConfigGeneration,
    ) -> Result<Ack, SupervisorError>;

    /// Drive the supervised process to the desired run state. Requesting a
    /// state already in effect succeeds immediately.
    async fn set_run_state(&self, desired: RunState) -> Result<Ack, SupervisorError>;

    /// One health observation. Callers bound this with a timeout; a missing
    /// reply means unreachable, not crashed.
    async fn sample_health(&self) -> Result<HealthSample, SupervisorError>;

    /// A finite log slice, restartable from the returned cursor.
    async fn fetch_logs(&self, cursor: u64, limit: usize) -> Result<LogChunk, SupervisorError>;
}

/// Resolves a node's connection metadata to a supervisor handle. The engine
/// and poller go through this seam so tests can substitute fakes.
pub trait SupervisorFactory: Send + Sync {
    fn supervisor_for(&self, node: &Node) -> Arc<dyn AgentSupervisor>;
}

/// Acknowledgement for the two mutating operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {
    /// False when the request was an idempotent no-op.
    pub changed: bool,
}

/// Wire request for `set_run_state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunStateRequest {
    pub desired: RunState,
}
