//! Fleet registry — the authoritative map of node identity to connection
//! metadata, desired state, observed state, and generation history.
//!
//! Mutations serialize per node identity: each node lives behind its own
//! `Mutex` inside an outer `RwLock`'d map, so concurrent operations on
//! different nodes proceed independently while operations on the same node
//! queue. `list()` is snapshot-consistent. Every accepted mutation persists
//! the whole fleet through the checksummed [`FleetStore`].
//!
//! Desired state is only ever written here through operator-action methods
//! (`register`, `set_desired_run_state`, `submit_configuration`, `rollback`);
//! observed state only through `record_observation`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::generation::{ConfigGeneration, ValidationResult};
use crate::domain::node::{ConnectionMeta, DesiredState, Node, NodeId, ObservedState, RunState};
use crate::error::RegistryError;
use crate::store::{FleetStore, StoreError, StoredFleet};
use crate::validator::{self, ValidationSchema};

#[derive(Default)]
struct Inner {
    entries: HashMap<NodeId, Arc<Mutex<Node>>>,
    /// Registration order, the order `list()` returns.
    order: Vec<NodeId>,
}

/// Outcome of an accepted configuration submission.
#[derive(Debug, Clone)]
pub struct ConfigSubmission {
    pub generation: ConfigGeneration,
    pub previous: DesiredState,
    pub desired: DesiredState,
}

/// Outcome of a rollback to an earlier generation.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub generation: ConfigGeneration,
    pub previous: DesiredState,
    pub desired: DesiredState,
}

pub struct FleetRegistry {
    inner: RwLock<Inner>,
    store: FleetStore,
}

impl FleetRegistry {
    /// Load the registry from the fleet store. A missing file starts an empty
    /// fleet; a corrupt or checksum-mismatched file is reported and treated
    /// as absent rather than taking the daemon down.
    pub async fn load(store: FleetStore) -> Self {
        let mut inner = Inner::default();

        if store.exists() {
            match store.read().await {
                Ok(stored) => {
                    info!(
                        nodes = stored.nodes.len(),
                        checksum = %stored.checksum,
                        "loaded fleet state from disk"
                    );
                    for node in stored.nodes {
                        inner.order.push(node.identity.clone());
                        inner
                            .entries
                            .insert(node.identity.clone(), Arc::new(Mutex::new(node)));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to load fleet state, starting empty");
                }
            }
        } else {
            info!("no fleet state file found, starting empty");
        }

        Self {
            inner: RwLock::new(inner),
            store,
        }
    }

    /// Register a new node. Fails with `DuplicateNode` if the identity is
    /// already present.
    pub async fn register(
        &self,
        identity: NodeId,
        connection: ConnectionMeta,
    ) -> Result<Node, RegistryError> {
        let node = {
            let mut inner = self.inner.write().await;
            if inner.entries.contains_key(&identity) {
                return Err(RegistryError::DuplicateNode(identity));
            }
            let node = Node::new(identity.clone(), connection);
            inner.order.push(identity.clone());
            inner
                .entries
                .insert(identity, Arc::new(Mutex::new(node.clone())));
            node
        };

        self.persist().await?;
        Ok(node)
    }

    /// Snapshot of one node.
    pub async fn get(&self, identity: &NodeId) -> Result<Node, RegistryError> {
        let entry = self.entry(identity).await?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    /// Point-in-time snapshot of the whole fleet, in registration order.
    pub async fn list(&self) -> Vec<Node> {
        let inner = self.inner.read().await;
        let mut nodes = Vec::with_capacity(inner.order.len());
        for identity in &inner.order {
            if let Some(entry) = inner.entries.get(identity) {
                nodes.push(entry.lock().await.clone());
            }
        }
        nodes
    }

    /// Remove a node. Requires desired AND observed run state to be stopped;
    /// a live node is never destructively removed.
    pub async fn deregister(&self, identity: &NodeId) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write().await;
            let entry = inner
                .entries
                .get(identity)
                .ok_or_else(|| RegistryError::UnknownNode(identity.clone()))?;

            {
                let node = entry.lock().await;
                if node.desired.run_state != RunState::Stopped {
                    return Err(RegistryError::NodePreconditionFailed {
                        node: identity.clone(),
                        detail: "desired run state is running".to_string(),
                    });
                }
                if node.observed.run_state != RunState::Stopped {
                    return Err(RegistryError::NodePreconditionFailed {
                        node: identity.clone(),
                        detail: "observed run state is running".to_string(),
                    });
                }
            }

            inner.entries.remove(identity);
            inner.order.retain(|id| id != identity);
        }

        self.persist().await?;
        Ok(())
    }

    /// Operator action: change a node's desired run state. Returns the
    /// previous and new desired state for audit logging.
    pub async fn set_desired_run_state(
        &self,
        identity: &NodeId,
        run_state: RunState,
    ) -> Result<(DesiredState, DesiredState), RegistryError> {
        let entry = self.entry(identity).await?;
        let (previous, desired) = {
            let mut node = entry.lock().await;
            let previous = node.desired.clone();
            node.desired.run_state = run_state;
            (previous, node.desired.clone())
        };

        self.persist().await?;
        Ok((previous, desired))
    }

    /// Operator action: submit a configuration payload. The payload is
    /// validated first; a rejection creates nothing and changes nothing. On
    /// acceptance a new immutable generation is appended and becomes the
    /// desired target.
    pub async fn submit_configuration(
        &self,
        identity: &NodeId,
        payload: serde_json::Value,
        schema: &ValidationSchema,
    ) -> Result<Result<ConfigSubmission, ValidationResult>, RegistryError> {
        let entry = self.entry(identity).await?;

        let submission = {
            let mut node = entry.lock().await;

            let validation = validator::validate(&payload, schema);
            if !validation.accepted {
                return Ok(Err(validation));
            }

            let generation =
                ConfigGeneration::new(node.next_generation_id(), payload, validation);
            let previous = node.desired.clone();
            node.desired.target_generation = Some(generation.id);
            node.generations.push(generation.clone());

            ConfigSubmission {
                generation,
                previous,
                desired: node.desired.clone(),
            }
        };

        self.persist().await?;
        Ok(Ok(submission))
    }

    /// Operator action: re-target an earlier generation. History is never
    /// mutated; the prior generation simply becomes the target again.
    pub async fn rollback(
        &self,
        identity: &NodeId,
        generation_id: u64,
    ) -> Result<RollbackOutcome, RegistryError> {
        let entry = self.entry(identity).await?;

        let outcome = {
            let mut node = entry.lock().await;
            let generation = node
                .generation(generation_id)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownGeneration {
                    node: identity.clone(),
                    generation: generation_id,
                })?;

            let previous = node.desired.clone();
            node.desired.target_generation = Some(generation.id);

            RollbackOutcome {
                generation,
                previous,
                desired: node.desired.clone(),
            }
        };

        self.persist().await?;
        Ok(outcome)
    }

    /// Full immutable generation history for a node.
    pub async fn generations(
        &self,
        identity: &NodeId,
    ) -> Result<Vec<ConfigGeneration>, RegistryError> {
        let entry = self.entry(identity).await?;
        let node = entry.lock().await;
        Ok(node.generations.clone())
    }

    /// Reconciliation-engine / health-aggregator write path: update a node's
    /// observed state from a remote response. Never touches desired state.
    pub async fn record_observation<F>(
        &self,
        identity: &NodeId,
        update: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ObservedState),
    {
        let entry = self.entry(identity).await?;
        {
            let mut node = entry.lock().await;
            update(&mut node.observed);
        }

        self.persist().await?;
        Ok(())
    }

    async fn entry(&self, identity: &NodeId) -> Result<Arc<Mutex<Node>>, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNode(identity.clone()))
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.list().await;
        self.store.write(&StoredFleet::new(snapshot)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection(host: &str) -> ConnectionMeta {
        ConnectionMeta {
            base_url: format!("http://{host}:9100"),
            token: "node-token".to_string(),
            timeout_secs: 10,
        }
    }

    fn accepted_payload() -> serde_json::Value {
        json!({
            "agent": { "name": "rachel", "command": "voice-agent" },
            "llm": { "provider": "groq" },
            "telephony": { "phone_number": "+97140000000" },
            "credentials": { "api_key_ref": "customer/rachel/groq" }
        })
    }

    async fn registry() -> (FleetRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::new(dir.path().join("fleet.json"));
        (FleetRegistry::load(store).await, dir)
    }

    #[tokio::test]
    async fn register_then_duplicate_fails() {
        let (registry, _dir) = registry().await;

        registry
            .register(NodeId::new("acme"), connection("acme"))
            .await
            .unwrap();

        let err = registry
            .register(NodeId::new("acme"), connection("acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateNode(_)));
    }

    #[tokio::test]
    async fn list_preserves_registration_order() {
        let (registry, _dir) = registry().await;
        for id in ["gamma", "alpha", "beta"] {
            registry
                .register(NodeId::new(id), connection(id))
                .await
                .unwrap();
        }

        let ids: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .map(|n| n.identity.0)
            .collect();
        assert_eq!(ids, vec!["gamma", "alpha", "beta"]);
    }

    #[tokio::test]
    async fn deregister_requires_fully_stopped() {
        let (registry, _dir) = registry().await;
        let id = NodeId::new("acme");
        registry.register(id.clone(), connection("acme")).await.unwrap();

        registry
            .set_desired_run_state(&id, RunState::Running)
            .await
            .unwrap();
        let err = registry.deregister(&id).await.unwrap_err();
        assert!(matches!(err, RegistryError::NodePreconditionFailed { .. }));

        registry
            .set_desired_run_state(&id, RunState::Stopped)
            .await
            .unwrap();
        registry
            .record_observation(&id, |obs| obs.run_state = RunState::Running)
            .await
            .unwrap();
        let err = registry.deregister(&id).await.unwrap_err();
        assert!(matches!(err, RegistryError::NodePreconditionFailed { .. }));

        registry
            .record_observation(&id, |obs| obs.run_state = RunState::Stopped)
            .await
            .unwrap();
        registry.deregister(&id).await.unwrap();
        assert!(matches!(
            registry.get(&id).await.unwrap_err(),
            RegistryError::UnknownNode(_)
        ));
    }

    #[tokio::test]
    async fn generations_are_monotonic_and_immutable() {
        let (registry, _dir) = registry().await;
        let id = NodeId::new("acme");
        registry.register(id.clone(), connection("acme")).await.unwrap();

        let schema = ValidationSchema::default();
        let mut last = 0;
        for _ in 0..5 {
            let submission = registry
                .submit_configuration(&id, accepted_payload(), &schema)
                .await
                .unwrap()
                .unwrap();
            assert!(submission.generation.id > last);
            last = submission.generation.id;
        }

        // Roll back from generation 5 to generation 3.
        let outcome = registry.rollback(&id, 3).await.unwrap();
        assert_eq!(outcome.desired.target_generation, Some(3));

        // Generation 5 is still retrievable from history, untouched.
        let history = registry.generations(&id).await.unwrap();
        assert_eq!(history.len(), 5);
        assert!(history.iter().any(|g| g.id == 5));

        let err = registry.rollback(&id, 99).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownGeneration { .. }));
    }

    #[tokio::test]
    async fn rejected_submission_creates_nothing() {
        let (registry, _dir) = registry().await;
        let id = NodeId::new("acme");
        registry.register(id.clone(), connection("acme")).await.unwrap();

        let rejection = registry
            .submit_configuration(&id, json!({ "agent": {} }), &ValidationSchema::default())
            .await
            .unwrap()
            .unwrap_err();
        assert!(!rejection.accepted);
        assert!(!rejection.errors.is_empty());

        assert!(registry.generations(&id).await.unwrap().is_empty());
        assert_eq!(
            registry.get(&id).await.unwrap().desired.target_generation,
            None
        );
    }

    #[tokio::test]
    async fn fleet_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");

        {
            let registry = FleetRegistry::load(FleetStore::new(path.clone())).await;
            let id = NodeId::new("acme");
            registry.register(id.clone(), connection("acme")).await.unwrap();
            registry
                .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
                .await
                .unwrap()
                .unwrap();
            registry
                .set_desired_run_state(&id, RunState::Running)
                .await
                .unwrap();
        }

        let reloaded = FleetRegistry::load(FleetStore::new(path)).await;
        let node = reloaded.get(&NodeId::new("acme")).await.unwrap();
        assert_eq!(node.desired.run_state, RunState::Running);
        assert_eq!(node.desired.target_generation, Some(1));
        assert_eq!(node.generations.len(), 1);
    }
}
