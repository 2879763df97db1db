//! Node — one supervised remote unit in the fleet.
//!
//! A `Node` carries its desired state (set only by accepted operator actions)
//! and its observed state (set only by the reconciliation engine and health
//! aggregator from remote responses). Configuration generations live with the
//! node so the whole fleet persists as one document.

use async_graphql::{Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::generation::ConfigGeneration;

/// Stable customer/node identifier. Unique and immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

async_graphql::scalar!(NodeId);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Run state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// How the controller reaches a node's supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct ConnectionMeta {
    /// Base URL of the node's supervisor API, e.g. `http://10.0.4.17:9100`.
    pub base_url: String,
    /// Bearer credential forwarded on every supervisor call. Opaque to the
    /// core; resolved by whoever registered the node.
    #[graphql(skip)]
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Operator-intended state for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct DesiredState {
    pub run_state: RunState,
    /// Target configuration generation. `None` until the first accepted push.
    pub target_generation: Option<u64>,
}

/// Last state actually confirmed from the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, SimpleObject)]
pub struct ObservedState {
    pub run_state: RunState,
    /// Generation the node last reported as active.
    pub active_generation: Option<u64>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// A registered fleet node: identity, connection metadata, desired and
/// observed state, and its immutable configuration generation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub identity: NodeId,
    pub connection: ConnectionMeta,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub generations: Vec<ConfigGeneration>,
}

impl Node {
    pub fn new(identity: NodeId, connection: ConnectionMeta) -> Self {
        Self {
            identity,
            connection,
            desired: DesiredState::default(),
            observed: ObservedState::default(),
            registered_at: Utc::now(),
            generations: Vec::new(),
        }
    }

    /// Look up a generation by id in this node's history.
    pub fn generation(&self, id: u64) -> Option<&ConfigGeneration> {
        self.generations.iter().find(|g| g.id == id)
    }

    /// Next generation id for this node. Ids increase monotonically per node.
    pub fn next_generation_id(&self) -> u64 {
        self.generations.iter().map(|g| g.id).max().unwrap_or(0) + 1
    }
}
