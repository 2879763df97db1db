//! Reconciliation engine — drives each node's observed state toward its
//! desired state.
//!
//! One long-lived worker task per registered node consumes a
//! `tokio::sync::watch` channel holding the latest queued work, so at most
//! one attempt is ever in flight per node and a newer desired-state change
//! supersedes queued or retrying work (last-writer-wins). Cancellation is
//! cooperative: an in-flight remote call completes and its result is
//! discarded if the attempt was superseded meanwhile.
//!
//! Transport failures retry with exponential backoff up to a ceiling and a
//! maximum attempt count; application rejections fail the attempt
//! immediately. The engine never touches desired state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::domain::attempt::{Attempt, AttemptState, WorkKind};
use crate::domain::node::{Node, NodeId, RunState};
use crate::error::{RegistryError, SupervisorError};
use crate::health::{self, HealthAggregator};
use crate::registry::FleetRegistry;
use crate::supervisor::{AgentSupervisor, SupervisorFactory};

#[derive(Clone)]
struct QueuedWork {
    attempt_id: Uuid,
    kind: WorkKind,
}

pub struct ReconcileEngine {
    registry: Arc<FleetRegistry>,
    health: Arc<HealthAggregator>,
    supervisors: Arc<dyn SupervisorFactory>,
    retry: RetryConfig,
    attempts: RwLock<HashMap<Uuid, Attempt>>,
    /// Latest attempt per node, the one `enqueue` supersedes.
    latest: RwLock<HashMap<NodeId, Uuid>>,
    workers: Mutex<HashMap<NodeId, watch::Sender<QueuedWork>>>,
}

impl ReconcileEngine {
    pub fn new(
        registry: Arc<FleetRegistry>,
        health: Arc<HealthAggregator>,
        supervisors: Arc<dyn SupervisorFactory>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            health,
            supervisors,
            retry,
            attempts: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a reconciliation attempt for a node. Any non-terminal earlier
    /// attempt for the same node is superseded; the fresh attempt targets the
    /// newest desired state.
    pub async fn enqueue(
        self: &Arc<Self>,
        node_id: &NodeId,
        kind: WorkKind,
    ) -> Result<Uuid, RegistryError> {
        // Existence check up front so callers get UnknownNode synchronously.
        self.registry.get(node_id).await?;

        let attempt = Attempt::new(node_id.clone(), kind);
        let attempt_id = attempt.id;

        // The workers lock serializes enqueues, so supersede bookkeeping and
        // channel delivery happen in the same order: the watch value and the
        // `latest` entry always agree on which attempt is current.
        let mut workers = self.workers.lock().await;

        {
            let latest = self.latest.read().await.get(node_id).copied();
            let mut attempts = self.attempts.write().await;
            if let Some(previous_id) = latest {
                if let Some(previous) = attempts.get_mut(&previous_id) {
                    if !previous.state.is_terminal() {
                        previous.state = AttemptState::Superseded;
                        previous.finished_at = Some(Utc::now());
                        debug!(node = %node_id, attempt = %previous_id, "attempt superseded");
                    }
                }
            }
            attempts.insert(attempt_id, attempt);
        }
        self.latest.write().await.insert(node_id.clone(), attempt_id);

        let work = QueuedWork { attempt_id, kind };
        let delivered = match workers.get(node_id) {
            Some(tx) => tx.send(work.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            let (tx, rx) = watch::channel(work);
            let engine = Arc::clone(self);
            let worker_node = node_id.clone();
            tokio::spawn(async move { engine.worker_loop(worker_node, rx).await });
            workers.insert(node_id.clone(), tx);
        }

        Ok(attempt_id)
    }

    /// `enqueue` behind an explicitly-`Send` boxed future. Used by the
    /// recursive follow-up path to break async `Send`-inference recursion
    /// between `enqueue` and the `worker_loop` it spawns.
    fn enqueue_boxed<'a>(
        self: &'a Arc<Self>,
        node_id: &'a NodeId,
        kind: WorkKind,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, RegistryError>> + Send + 'a>> {
        Box::pin(self.enqueue(node_id, kind))
    }

    /// Attempt by id, for status polling.
    pub async fn attempt(&self, id: &Uuid) -> Option<Attempt> {
        self.attempts.read().await.get(id).cloned()
    }

    /// Latest attempt for a node, if any.
    pub async fn latest_attempt(&self, node_id: &NodeId) -> Option<Attempt> {
        let id = self.latest.read().await.get(node_id).copied()?;
        self.attempt(&id).await
    }

    /// Latest attempt per node, for fleet-wide counters.
    pub async fn latest_attempts(&self) -> HashMap<NodeId, Attempt> {
        let latest = self.latest.read().await.clone();
        let attempts = self.attempts.read().await;
        latest
            .into_iter()
            .filter_map(|(node, id)| attempts.get(&id).cloned().map(|a| (node, a)))
            .collect()
    }

    /// Forget a deregistered node: its worker winds down when the channel
    /// closes, attempt history for the node is dropped.
    pub async fn forget_node(&self, node_id: &NodeId) {
        self.workers.lock().await.remove(node_id);
        if let Some(id) = self.latest.write().await.remove(node_id) {
            self.attempts.write().await.remove(&id);
        }
        self.attempts
            .write()
            .await
            .retain(|_, attempt| &attempt.node != node_id);
    }

    /// Re-derive in-flight work from durable state after a controller
    /// restart: any node whose observed generation or run state diverges from
    /// desired gets a corrective attempt. The in-memory queue is never
    /// persisted.
    pub async fn startup_scan(self: &Arc<Self>) {
        for node in self.registry.list().await {
            if let Some(kind) = divergence(&node) {
                info!(node = %node.identity, operation = %kind, "startup scan enqueueing");
                if let Err(e) = self.enqueue(&node.identity, kind).await {
                    warn!(node = %node.identity, error = %e, "startup enqueue failed");
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, node_id: NodeId, mut rx: watch::Receiver<QueuedWork>) {
        let mut last_processed: Option<Uuid> = None;
        loop {
            let work = rx.borrow_and_update().clone();
            if last_processed != Some(work.attempt_id) {
                let probe = rx.clone();
                self.run_attempt(&node_id, &work, probe).await;
                last_processed = Some(work.attempt_id);
                // Loop once more: newer work may have arrived mid-attempt.
                continue;
            }
            if rx.changed().await.is_err() {
                debug!(node = %node_id, "reconcile worker stopping");
                return;
            }
        }
    }

    async fn run_attempt(
        self: &Arc<Self>,
        node_id: &NodeId,
        work: &QueuedWork,
        probe: watch::Receiver<QueuedWork>,
    ) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut tries = 0u32;

        loop {
            if self.is_superseded(work.attempt_id).await {
                return;
            }

            tries += 1;
            self.update_attempt(work.attempt_id, |a| {
                a.state = AttemptState::InProgress;
                a.tries = tries;
                a.next_retry_at = None;
            })
            .await;

            let node = match self.registry.get(node_id).await {
                Ok(node) => node,
                Err(_) => {
                    // Deregistered mid-flight; nothing left to drive.
                    self.finish(work.attempt_id, AttemptState::Superseded, None).await;
                    return;
                }
            };

            let supervisor = self.supervisors.supervisor_for(&node);
            let result = execute(supervisor.as_ref(), &node, &work.kind).await;

            // The remote call ran to completion; if newer work landed
            // meanwhile, its result is stale and gets discarded.
            if self.is_superseded(work.attempt_id).await {
                return;
            }

            let failure = match result {
                Ok(()) => match self.confirm(&node, &work.kind, supervisor.as_ref()).await {
                    Ok(()) => {
                        self.succeed(node_id, work).await;
                        return;
                    }
                    Err(message) => message,
                },
                Err(e) if e.is_retryable() => e.to_string(),
                Err(e) => {
                    self.fail(node_id, work, e.to_string()).await;
                    return;
                }
            };

            self.record_failed_try(node_id).await;

            if tries >= max_attempts {
                self.fail_exhausted(node_id, work, failure).await;
                return;
            }

            let delay = backoff_delay(&self.retry, tries);
            self.update_attempt(work.attempt_id, |a| {
                a.state = AttemptState::RetryScheduled;
                a.last_error = Some(failure.clone());
                a.next_retry_at = Utc::now()
                    .checked_add_signed(chrono::Duration::milliseconds(delay.as_millis() as i64));
            })
            .await;
            debug!(
                node = %node_id,
                attempt = %work.attempt_id,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );

            let mut probe = probe.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // Newer work for this node supersedes the scheduled retry.
                _ = probe.changed() => return,
            }
        }
    }

    /// Success requires the ack plus a confirming health sample showing the
    /// expected run state / active generation. The sample doubles as window
    /// evidence for the aggregator.
    async fn confirm(
        &self,
        node: &Node,
        kind: &WorkKind,
        supervisor: &dyn AgentSupervisor,
    ) -> Result<(), String> {
        let sample = supervisor
            .sample_health()
            .await
            .map_err(|e| format!("confirmation sample failed: {e}"))?;

        health::record_sample(&self.registry, &self.health, &node.identity, sample.clone()).await;

        let confirmed = match kind {
            WorkKind::ApplyConfiguration { generation } => {
                sample.active_generation == Some(*generation)
            }
            WorkKind::SetRunState { desired } => sample.run_state == *desired,
            WorkKind::Restart => sample.run_state == RunState::Running,
        };

        if confirmed {
            Ok(())
        } else {
            Err(format!(
                "health sample did not confirm {kind}: run_state={}, active_generation={:?}",
                sample.run_state, sample.active_generation
            ))
        }
    }

    async fn succeed(self: &Arc<Self>, node_id: &NodeId, work: &QueuedWork) {
        let _ = self
            .registry
            .record_observation(node_id, |observed| {
                observed.last_reconciled_at = Some(Utc::now());
                observed.consecutive_failures = 0;
            })
            .await;
        self.finish(work.attempt_id, AttemptState::Succeeded, None).await;
        info!(node = %node_id, operation = %work.kind, "reconciliation succeeded");

        self.chain_follow_up(node_id).await;
    }

    async fn fail(&self, node_id: &NodeId, work: &QueuedWork, message: String) {
        self.record_failed_try(node_id).await;
        warn!(node = %node_id, operation = %work.kind, error = %message, "reconciliation failed");
        self.finish(work.attempt_id, AttemptState::Failed, Some(message)).await;
    }

    async fn fail_exhausted(&self, node_id: &NodeId, work: &QueuedWork, last_error: String) {
        let message = format!(
            "retry budget exhausted after {} attempts: {last_error}",
            self.retry.max_attempts.max(1)
        );
        warn!(node = %node_id, operation = %work.kind, error = %message, "reconciliation failed");
        self.finish(work.attempt_id, AttemptState::Failed, Some(message)).await;
    }

    /// After a success, any remaining divergence (e.g. a config push landed
    /// but the node should also be running) gets its own follow-up attempt.
    async fn chain_follow_up(self: &Arc<Self>, node_id: &NodeId) {
        let Ok(node) = self.registry.get(node_id).await else {
            return;
        };
        if let Some(kind) = divergence(&node) {
            debug!(node = %node_id, operation = %kind, "follow-up reconciliation");
            // Go through `enqueue_boxed` so the recursive edge carries an
            // explicit `Send` bound, breaking the Send-inference cycle between
            // `enqueue` (which spawns `worker_loop`) and `worker_loop` (which
            // calls back into here).
            if let Err(e) = self.enqueue_boxed(node_id, kind).await {
                warn!(node = %node_id, error = %e, "follow-up enqueue failed");
            }
        }
    }

    async fn record_failed_try(&self, node_id: &NodeId) {
        let _ = self
            .registry
            .record_observation(node_id, |observed| {
                observed.consecutive_failures = observed.consecutive_failures.saturating_add(1);
            })
            .await;
    }

    async fn is_superseded(&self, attempt_id: Uuid) -> bool {
        self.attempts
            .read()
            .await
            .get(&attempt_id)
            .map_or(true, |a| a.state == AttemptState::Superseded)
    }

    async fn update_attempt<F: FnOnce(&mut Attempt)>(&self, attempt_id: Uuid, update: F) {
        if let Some(attempt) = self.attempts.write().await.get_mut(&attempt_id) {
            update(attempt);
        }
    }

    async fn finish(&self, attempt_id: Uuid, state: AttemptState, last_error: Option<String>) {
        self.update_attempt(attempt_id, |a| {
            a.state = state;
            a.last_error = last_error.or(a.last_error.take());
            a.next_retry_at = None;
            a.finished_at = Some(Utc::now());
        })
        .await;
    }
}

/// Corrective operation for a node whose observed state diverges from its
/// desired state, configuration first.
fn divergence(node: &Node) -> Option<WorkKind> {
    if let Some(target) = node.desired.target_generation {
        if node.observed.active_generation != Some(target) {
            return Some(WorkKind::ApplyConfiguration { generation: target });
        }
    }
    if node.desired.run_state != node.observed.run_state {
        return Some(WorkKind::SetRunState {
            desired: node.desired.run_state,
        });
    }
    None
}

async fn execute(
    supervisor: &dyn AgentSupervisor,
    node: &Node,
    kind: &WorkKind,
) -> Result<(), SupervisorError> {
    match kind {
        WorkKind::ApplyConfiguration { generation } => {
            let generation = node.generation(*generation).ok_or_else(|| {
                SupervisorError::Rejected {
                    code: "unknown_generation".to_string(),
                    message: format!("generation {generation} not in node history"),
                }
            })?;
            supervisor.apply_configuration(generation).await?;
            Ok(())
        }
        WorkKind::SetRunState { desired } => {
            supervisor.set_run_state(*desired).await?;
            Ok(())
        }
        // Restart is stop-then-start through the idempotent run-state
        // operation, inside a single attempt.
        WorkKind::Restart => {
            supervisor.set_run_state(RunState::Stopped).await?;
            supervisor.set_run_state(RunState::Running).await?;
            Ok(())
        }
    }
}

/// Exponential backoff with a ceiling and a bounded jitter factor. With
/// jitter at or below 1.0 the delay sequence is non-decreasing until the
/// ceiling.
fn backoff_delay(retry: &RetryConfig, tries: u32) -> Duration {
    let exponent = tries.saturating_sub(1).min(16);
    let base = retry
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.max_delay_ms);

    let jitter = retry.jitter.clamp(0.0, 1.0);
    let factor = 1.0 + rand::rng().random::<f64>() * jitter;
    Duration::from_millis((base as f64 * factor) as u64)
}
