//! Health aggregator — sliding windows of samples and derived classification.
//!
//! Each node keeps a bounded, recency-ordered window of recent samples.
//! Classification is computed on demand from the window and a freshness
//! threshold, never stored: a node that has gone silent classifies
//! unreachable no matter what its last sample said.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::domain::health::{HealthClass, HealthSample};
use crate::domain::node::NodeId;
use crate::error::RegistryError;
use crate::registry::FleetRegistry;
use crate::supervisor::SupervisorFactory;

pub struct HealthAggregator {
    windows: RwLock<HashMap<NodeId, VecDeque<HealthSample>>>,
    config: HealthConfig,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Append a sample to the node's window, dropping the oldest entries
    /// beyond the configured window size.
    pub async fn record(&self, sample: HealthSample) {
        let mut windows = self.windows.write().await;
        let window = windows.entry(sample.node_id.clone()).or_default();
        window.push_back(sample);
        while window.len() > self.config.window_size {
            window.pop_front();
        }
    }

    /// Current classification for a node.
    pub async fn classify(&self, node_id: &NodeId) -> HealthClass {
        self.classify_at(node_id, Utc::now()).await
    }

    /// Classification at an explicit instant. Separated from [`classify`] so
    /// freshness behavior is testable without waiting out the threshold.
    pub async fn classify_at(&self, node_id: &NodeId, now: DateTime<Utc>) -> HealthClass {
        let windows = self.windows.read().await;
        let latest = windows.get(node_id).and_then(|w| w.back());

        let Some(sample) = latest else {
            return HealthClass::Unreachable;
        };

        let age = now.signed_duration_since(sample.taken_at);
        if age.num_seconds() > self.config.freshness_secs as i64 {
            return HealthClass::Unreachable;
        }

        if sample.error
            || sample.cpu_percent > self.config.cpu_threshold_percent
            || sample.memory_percent > self.config.memory_threshold_percent
        {
            return HealthClass::Degraded;
        }

        HealthClass::Healthy
    }

    /// Most recent sample for a node, if any.
    pub async fn latest(&self, node_id: &NodeId) -> Option<HealthSample> {
        let windows = self.windows.read().await;
        windows.get(node_id).and_then(|w| w.back()).cloned()
    }

    /// Drop a deregistered node's window.
    pub async fn forget(&self, node_id: &NodeId) {
        self.windows.write().await.remove(node_id);
    }
}

/// Periodic health poll loop: each tick, every registered node is sampled
/// concurrently through its supervisor with a bounded timeout. Successful
/// samples land in the aggregator and update the node's observed state; a
/// missing reply records nothing — the freshness threshold turns silence
/// into `unreachable`.
pub async fn run_poll_loop(
    registry: Arc<FleetRegistry>,
    supervisors: Arc<dyn SupervisorFactory>,
    aggregator: Arc<HealthAggregator>,
    config: HealthConfig,
) {
    info!(
        interval_secs = config.poll_interval_secs,
        freshness_secs = config.freshness_secs,
        "starting health poll loop"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    let sample_timeout = Duration::from_secs(config.sample_timeout_secs);

    loop {
        interval.tick().await;

        for node in registry.list().await {
            let supervisor = supervisors.supervisor_for(&node);
            let registry = registry.clone();
            let aggregator = aggregator.clone();
            let identity = node.identity.clone();

            tokio::spawn(async move {
                match tokio::time::timeout(sample_timeout, supervisor.sample_health()).await {
                    Ok(Ok(sample)) => {
                        record_sample(&registry, &aggregator, &identity, sample).await;
                    }
                    Ok(Err(e)) => {
                        debug!(node = %identity, error = %e, "health sample failed");
                    }
                    Err(_) => {
                        debug!(node = %identity, "health sample timed out");
                    }
                }
            });
        }
    }
}

/// Record a sample as both window evidence and observed state. Shared by the
/// poll loop and the reconciliation engine's confirmation step.
pub async fn record_sample(
    registry: &FleetRegistry,
    aggregator: &HealthAggregator,
    identity: &NodeId,
    sample: HealthSample,
) {
    aggregator.record(sample.clone()).await;

    let result = registry
        .record_observation(identity, |observed| {
            observed.run_state = sample.run_state;
            observed.active_generation = sample.active_generation;
            observed.last_sample_at = Some(sample.taken_at);
        })
        .await;

    // The node may have been deregistered between listing and recording.
    if let Err(RegistryError::UnknownNode(_)) = result {
        aggregator.forget(identity).await;
    } else if let Err(e) = result {
        debug!(node = %identity, error = %e, "failed to record health observation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::RunState;
    use chrono::Duration as ChronoDuration;

    fn test_config() -> HealthConfig {
        HealthConfig {
            freshness_secs: 30,
            window_size: 3,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            ..HealthConfig::default()
        }
    }

    fn sample(node: &str, taken_at: DateTime<Utc>) -> HealthSample {
        HealthSample {
            node_id: NodeId::new(node),
            taken_at,
            run_state: RunState::Running,
            cpu_percent: 12.0,
            memory_percent: 30.0,
            uptime_secs: 600,
            restart_count: 0,
            active_generation: Some(1),
            error: false,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn no_samples_is_unreachable() {
        let aggregator = HealthAggregator::new(test_config());
        assert_eq!(
            aggregator.classify(&NodeId::new("acme")).await,
            HealthClass::Unreachable
        );
    }

    #[tokio::test]
    async fn stale_sample_is_unreachable_regardless_of_content() {
        let aggregator = HealthAggregator::new(test_config());
        let now = Utc::now();

        // A perfectly healthy sample, but past the freshness threshold.
        aggregator
            .record(sample("acme", now - ChronoDuration::seconds(31)))
            .await;

        assert_eq!(
            aggregator.classify_at(&NodeId::new("acme"), now).await,
            HealthClass::Unreachable
        );
    }

    #[tokio::test]
    async fn fresh_clean_sample_is_healthy() {
        let aggregator = HealthAggregator::new(test_config());
        let now = Utc::now();
        aggregator.record(sample("acme", now)).await;
        assert_eq!(
            aggregator.classify_at(&NodeId::new("acme"), now).await,
            HealthClass::Healthy
        );
    }

    #[tokio::test]
    async fn error_flag_or_resource_pressure_degrades() {
        let aggregator = HealthAggregator::new(test_config());
        let now = Utc::now();

        let mut s = sample("acme", now);
        s.error = true;
        aggregator.record(s).await;
        assert_eq!(
            aggregator.classify_at(&NodeId::new("acme"), now).await,
            HealthClass::Degraded
        );

        let mut s = sample("acme", now);
        s.cpu_percent = 97.5;
        aggregator.record(s).await;
        assert_eq!(
            aggregator.classify_at(&NodeId::new("acme"), now).await,
            HealthClass::Degraded
        );
    }

    #[tokio::test]
    async fn window_is_bounded_and_recency_ordered() {
        let aggregator = HealthAggregator::new(test_config());
        let now = Utc::now();

        for i in 0..10 {
            let mut s = sample("acme", now + ChronoDuration::seconds(i));
            s.uptime_secs = i as u64;
            aggregator.record(s).await;
        }

        let windows = aggregator.windows.read().await;
        let window = windows.get(&NodeId::new("acme")).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.back().unwrap().uptime_secs, 9);
    }
}
