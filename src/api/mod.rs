//! Control API: REST surface for operator tooling, read-only GraphQL surface
//! for dashboards, bearer auth shared by both.

pub mod auth;
pub mod graphql;
pub mod rest;

use crate::domain::node::Node;
use crate::domain::status::{FleetOverview, NodeStatus};
use crate::health::HealthAggregator;
use crate::reconcile::ReconcileEngine;
use crate::registry::FleetRegistry;

use crate::domain::attempt::{AttemptState, AttemptView};
use crate::domain::health::HealthClass;
use crate::domain::node::RunState;

/// Assemble the status view for one node.
pub async fn build_node_status(
    node: &Node,
    health: &HealthAggregator,
    engine: &ReconcileEngine,
) -> NodeStatus {
    let classification = health.classify(&node.identity).await;
    let last_sample = health.latest(&node.identity).await;
    let attempt = engine
        .latest_attempt(&node.identity)
        .await
        .map(|a| AttemptView::from(&a));

    NodeStatus {
        identity: node.identity.clone(),
        desired: node.desired.clone(),
        observed: node.observed.clone(),
        health: classification,
        last_sample,
        attempt,
        registered_at: node.registered_at,
    }
}

/// Aggregate fleet counters across all registered nodes.
pub async fn build_overview(
    registry: &FleetRegistry,
    health: &HealthAggregator,
    engine: &ReconcileEngine,
) -> FleetOverview {
    let nodes = registry.list().await;
    let latest = engine.latest_attempts().await;

    let mut overview = FleetOverview {
        total_nodes: nodes.len() as u32,
        ..FleetOverview::default()
    };

    for node in &nodes {
        if node.desired.run_state == RunState::Running {
            overview.desired_running += 1;
        }
        if node.observed.run_state == RunState::Running {
            overview.observed_running += 1;
        }
        match health.classify(&node.identity).await {
            HealthClass::Healthy => overview.healthy += 1,
            HealthClass::Degraded => overview.degraded += 1,
            HealthClass::Unreachable => overview.unreachable += 1,
        }
        if latest
            .get(&node.identity)
            .map_or(false, |a| a.state == AttemptState::Failed)
        {
            overview.failed_attempts += 1;
        }
    }

    overview
}
