//! Read-only GraphQL status surface for dashboards.
//!
//! Mounted beside the REST control API behind the same bearer auth. Only
//! queries — desired state changes go through REST so they are audited.

use async_graphql::{Context, EmptyMutation, EmptySubscription, Object, Schema};
use std::sync::Arc;

use crate::domain::generation::GenerationInfo;
use crate::domain::node::NodeId;
use crate::domain::status::{FleetOverview, NodeStatus};
use crate::health::HealthAggregator;
use crate::reconcile::ReconcileEngine;
use crate::registry::FleetRegistry;

pub type DroverSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Status for every registered node, in registration order.
    async fn fleet(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<NodeStatus>> {
        let registry = ctx.data::<Arc<FleetRegistry>>()?;
        let health = ctx.data::<Arc<HealthAggregator>>()?;
        let engine = ctx.data::<Arc<ReconcileEngine>>()?;

        let mut statuses = Vec::new();
        for node in registry.list().await {
            statuses.push(super::build_node_status(&node, health, engine).await);
        }
        Ok(statuses)
    }

    /// Status for one node, if registered.
    async fn node(
        &self,
        ctx: &Context<'_>,
        identity: String,
    ) -> async_graphql::Result<Option<NodeStatus>> {
        let registry = ctx.data::<Arc<FleetRegistry>>()?;
        let health = ctx.data::<Arc<HealthAggregator>>()?;
        let engine = ctx.data::<Arc<ReconcileEngine>>()?;

        match registry.get(&NodeId::new(identity)).await {
            Ok(node) => Ok(Some(super::build_node_status(&node, health, engine).await)),
            Err(_) => Ok(None),
        }
    }

    /// Aggregate fleet counters.
    async fn overview(&self, ctx: &Context<'_>) -> async_graphql::Result<FleetOverview> {
        let registry = ctx.data::<Arc<FleetRegistry>>()?;
        let health = ctx.data::<Arc<HealthAggregator>>()?;
        let engine = ctx.data::<Arc<ReconcileEngine>>()?;
        Ok(super::build_overview(registry, health, engine).await)
    }

    /// Generation history metadata for a node (payloads stay on REST).
    async fn generations(
        &self,
        ctx: &Context<'_>,
        identity: String,
    ) -> async_graphql::Result<Vec<GenerationInfo>> {
        let registry = ctx.data::<Arc<FleetRegistry>>()?;
        let generations = registry
            .generations(&NodeId::new(identity))
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(generations.iter().map(GenerationInfo::from).collect())
    }
}

pub fn build_schema(
    registry: Arc<FleetRegistry>,
    engine: Arc<ReconcileEngine>,
    health: Arc<HealthAggregator>,
) -> DroverSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(registry)
        .data(engine)
        .data(health)
        .finish()
}
