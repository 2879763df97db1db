//! Read-only status views served by the control API and GraphQL surface.

use async_graphql::SimpleObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::AttemptView;
use super::health::{HealthClass, HealthSample};
use super::node::{DesiredState, NodeId, ObservedState};

/// Current state of one node: desired + observed + derived health, plus the
/// latest health sample and reconciliation attempt if any.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct NodeStatus {
    pub identity: NodeId,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub health: HealthClass,
    pub last_sample: Option<HealthSample>,
    pub attempt: Option<AttemptView>,
    pub registered_at: DateTime<Utc>,
}

/// Aggregate fleet counters for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, SimpleObject)]
pub struct FleetOverview {
    pub total_nodes: u32,
    pub desired_running: u32,
    pub observed_running: u32,
    pub healthy: u32,
    pub degraded: u32,
    pub unreachable: u32,
    pub failed_attempts: u32,
}
