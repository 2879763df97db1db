//! Reconciliation engine behavior against a scripted in-memory supervisor:
//! per-node serialization, retry/backoff, supersede, bulk independence, and
//! desired-state ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use drover::config::{HealthConfig, RetryConfig};
use drover::domain::attempt::{Attempt, AttemptState, WorkKind};
use drover::domain::generation::ConfigGeneration;
use drover::domain::health::{HealthSample, LogChunk};
use drover::domain::node::{ConnectionMeta, Node, NodeId, RunState};
use drover::error::SupervisorError;
use drover::health::HealthAggregator;
use drover::reconcile::ReconcileEngine;
use drover::registry::FleetRegistry;
use drover::store::FleetStore;
use drover::supervisor::{Ack, AgentSupervisor, SupervisorFactory};
use drover::validator::ValidationSchema;

// ── Scripted supervisor ────────────────────────────────────

#[derive(Default)]
struct MockNode {
    run_state: Mutex<Option<RunState>>,
    active_generation: Mutex<Option<u64>>,
    /// Remaining primary-op calls that fail at the transport level.
    transport_failures: AtomicU32,
    /// Reject configuration application at the application level.
    reject_apply: AtomicBool,
    /// Concurrency watermark across all operations.
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    /// Instants of primary-op calls, for backoff gap assertions.
    op_instants: Mutex<Vec<Instant>>,
}

impl MockNode {
    fn run_state(&self) -> RunState {
        self.run_state.lock().unwrap().unwrap_or(RunState::Stopped)
    }
}

struct InFlightGuard<'a>(&'a MockNode);

impl<'a> InFlightGuard<'a> {
    fn enter(node: &'a MockNode) -> Self {
        let current = node.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        node.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self(node)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockSupervisor {
    node_id: NodeId,
    state: Arc<MockNode>,
}

impl MockSupervisor {
    fn primary_op(&self) -> Result<(), SupervisorError> {
        self.state.op_instants.lock().unwrap().push(Instant::now());

        let remaining = self.state.transport_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.transport_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SupervisorError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentSupervisor for MockSupervisor {
    async fn apply_configuration(
        &self,
        generation: &ConfigGeneration,
    ) -> Result<Ack, SupervisorError> {
        let _guard = InFlightGuard::enter(&self.state);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.primary_op()?;

        if self.state.reject_apply.load(Ordering::SeqCst) {
            return Err(SupervisorError::Rejected {
                code: "invalid_configuration".to_string(),
                message: "payload rejected by node".to_string(),
            });
        }

        let mut active = self.state.active_generation.lock().unwrap();
        let changed = *active != Some(generation.id);
        *active = Some(generation.id);
        Ok(Ack { changed })
    }

    async fn set_run_state(&self, desired: RunState) -> Result<Ack, SupervisorError> {
        let _guard = InFlightGuard::enter(&self.state);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.primary_op()?;

        let mut run_state = self.state.run_state.lock().unwrap();
        let changed = *run_state != Some(desired);
        *run_state = Some(desired);
        Ok(Ack { changed })
    }

    async fn sample_health(&self) -> Result<HealthSample, SupervisorError> {
        let _guard = InFlightGuard::enter(&self.state);
        tokio::time::sleep(Duration::from_millis(1)).await;

        Ok(HealthSample {
            node_id: self.node_id.clone(),
            taken_at: Utc::now(),
            run_state: self.state.run_state(),
            cpu_percent: 10.0,
            memory_percent: 20.0,
            uptime_secs: 60,
            restart_count: 1,
            active_generation: *self.state.active_generation.lock().unwrap(),
            error: false,
            error_message: None,
        })
    }

    async fn fetch_logs(&self, cursor: u64, _limit: usize) -> Result<LogChunk, SupervisorError> {
        Ok(LogChunk {
            lines: vec!["agent line".to_string()],
            next_cursor: cursor,
        })
    }
}

#[derive(Default)]
struct MockFleet {
    nodes: Mutex<HashMap<NodeId, Arc<MockNode>>>,
}

impl MockFleet {
    fn node(&self, id: &NodeId) -> Arc<MockNode> {
        self.nodes
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .clone()
    }
}

impl SupervisorFactory for MockFleet {
    fn supervisor_for(&self, node: &Node) -> Arc<dyn AgentSupervisor> {
        Arc::new(MockSupervisor {
            node_id: node.identity.clone(),
            state: self.node(&node.identity),
        })
    }
}

// ── Fixture ────────────────────────────────────────────────

struct Fixture {
    registry: Arc<FleetRegistry>,
    fleet: Arc<MockFleet>,
    engine: Arc<ReconcileEngine>,
    _dir: tempfile::TempDir,
}

async fn fixture(retry: RetryConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = FleetStore::new(dir.path().join("fleet.json"));
    let registry = Arc::new(FleetRegistry::load(store).await);
    let aggregator = Arc::new(HealthAggregator::new(HealthConfig::default()));
    let fleet = Arc::new(MockFleet::default());
    let engine = Arc::new(ReconcileEngine::new(
        registry.clone(),
        aggregator,
        fleet.clone(),
        retry,
    ));

    Fixture {
        registry,
        fleet,
        engine,
        _dir: dir,
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        base_delay_ms: 50,
        max_delay_ms: 1_000,
        jitter: 0.0,
        max_attempts,
    }
}

async fn register(fixture: &Fixture, id: &str) -> NodeId {
    let identity = NodeId::new(id);
    fixture
        .registry
        .register(
            identity.clone(),
            ConnectionMeta {
                base_url: format!("http://{id}.internal:9100"),
                token: "node-token".to_string(),
                timeout_secs: 10,
            },
        )
        .await
        .unwrap();
    identity
}

fn accepted_payload() -> serde_json::Value {
    serde_json::json!({
        "agent": { "name": "rachel", "command": "voice-agent" },
        "llm": { "provider": "groq" },
        "telephony": { "phone_number": "+97140000000" },
        "credentials": { "api_key_ref": "customer/rachel/groq" }
    })
}

async fn wait_terminal(engine: &ReconcileEngine, attempt_id: uuid::Uuid) -> Attempt {
    for _ in 0..2_000 {
        if let Some(attempt) = engine.attempt(&attempt_id).await {
            if attempt.state.is_terminal() {
                return attempt;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("attempt {attempt_id} never reached a terminal state");
}

// ── Properties ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transport_failures_retry_with_non_decreasing_delays_then_succeed() {
    let fixture = fixture(fast_retry(5)).await;
    let id = register(&fixture, "acme").await;

    // First 2 of 3 tries fail at the transport level.
    fixture
        .fleet
        .node(&id)
        .transport_failures
        .store(2, Ordering::SeqCst);

    fixture
        .registry
        .set_desired_run_state(&id, RunState::Running)
        .await
        .unwrap();
    let attempt_id = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::SetRunState {
                desired: RunState::Running,
            },
        )
        .await
        .unwrap();

    let attempt = wait_terminal(&fixture.engine, attempt_id).await;
    assert_eq!(attempt.state, AttemptState::Succeeded);
    assert_eq!(attempt.tries, 3);

    // Delays between tries are non-decreasing until success.
    let instants = fixture.fleet.node(&id).op_instants.lock().unwrap().clone();
    assert_eq!(instants.len(), 3);
    let first_gap = instants[1] - instants[0];
    let second_gap = instants[2] - instants[1];
    assert!(second_gap >= first_gap, "{second_gap:?} < {first_gap:?}");

    // The node actually reached the desired state.
    assert_eq!(fixture.fleet.node(&id).run_state(), RunState::Running);
    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.observed.run_state, RunState::Running);
    assert_eq!(node.observed.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retry_budget_fails_and_preserves_desired_state() {
    let fixture = fixture(fast_retry(3)).await;
    let id = register(&fixture, "acme").await;

    fixture
        .fleet
        .node(&id)
        .transport_failures
        .store(u32::MAX, Ordering::SeqCst);

    fixture
        .registry
        .set_desired_run_state(&id, RunState::Running)
        .await
        .unwrap();
    let attempt_id = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::SetRunState {
                desired: RunState::Running,
            },
        )
        .await
        .unwrap();

    let attempt = wait_terminal(&fixture.engine, attempt_id).await;
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.tries, 3);
    assert!(attempt.last_error.unwrap().contains("retry budget exhausted"));

    // The engine never reverts desired state to mask a failure.
    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.desired.run_state, RunState::Running);
    assert!(node.observed.consecutive_failures >= 3);
}

#[tokio::test(start_paused = true)]
async fn application_rejection_is_immediately_fatal() {
    let fixture = fixture(fast_retry(5)).await;
    let id = register(&fixture, "acme").await;
    fixture.fleet.node(&id).reject_apply.store(true, Ordering::SeqCst);

    let submission = fixture
        .registry
        .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
        .await
        .unwrap()
        .unwrap();
    let attempt_id = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::ApplyConfiguration {
                generation: submission.generation.id,
            },
        )
        .await
        .unwrap();

    let attempt = wait_terminal(&fixture.engine, attempt_id).await;
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.tries, 1, "no retries after an application rejection");

    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.desired.target_generation, Some(1));
}

#[tokio::test(start_paused = true)]
async fn at_most_one_attempt_in_flight_per_node() {
    let fixture = fixture(fast_retry(2)).await;
    let id = register(&fixture, "acme").await;

    // Hammer the node with rapid desired-state changes from many tasks.
    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = fixture.engine.clone();
        let registry = fixture.registry.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let desired = if i % 2 == 0 {
                RunState::Running
            } else {
                RunState::Stopped
            };
            registry.set_desired_run_state(&id, desired).await.unwrap();
            engine
                .enqueue(&id, WorkKind::SetRunState { desired })
                .await
                .unwrap()
        }));
    }

    let mut last = None;
    for handle in handles {
        last = Some(handle.await.unwrap());
    }

    // Wait for the engine to quiesce: every attempt terminal.
    wait_terminal(&fixture.engine, last.unwrap()).await;
    for _ in 0..1_000 {
        let latest = fixture.engine.latest_attempt(&id).await.unwrap();
        if latest.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        fixture.fleet.node(&id).max_in_flight.load(Ordering::SeqCst),
        1,
        "two supervisor calls overlapped for one node"
    );
}

#[tokio::test(start_paused = true)]
async fn newer_change_supersedes_scheduled_retry() {
    let fixture = fixture(fast_retry(10)).await;
    let id = register(&fixture, "acme").await;

    fixture
        .fleet
        .node(&id)
        .transport_failures
        .store(1, Ordering::SeqCst);

    fixture
        .registry
        .set_desired_run_state(&id, RunState::Running)
        .await
        .unwrap();
    let first = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::SetRunState {
                desired: RunState::Running,
            },
        )
        .await
        .unwrap();

    // Let the first try fail and the retry get scheduled.
    for _ in 0..1_000 {
        if let Some(attempt) = fixture.engine.attempt(&first).await {
            if attempt.state == AttemptState::RetryScheduled {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Last-writer-wins: the newer change discards the scheduled retry.
    fixture
        .registry
        .set_desired_run_state(&id, RunState::Stopped)
        .await
        .unwrap();
    let second = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::SetRunState {
                desired: RunState::Stopped,
            },
        )
        .await
        .unwrap();

    let second_attempt = wait_terminal(&fixture.engine, second).await;
    assert_eq!(second_attempt.state, AttemptState::Succeeded);

    let first_attempt = fixture.engine.attempt(&first).await.unwrap();
    assert_eq!(first_attempt.state, AttemptState::Superseded);

    assert_eq!(fixture.fleet.node(&id).run_state(), RunState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn applying_the_same_generation_twice_is_idempotent() {
    let fixture = fixture(fast_retry(3)).await;
    let id = register(&fixture, "acme").await;

    let submission = fixture
        .registry
        .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
        .await
        .unwrap()
        .unwrap();
    let generation = submission.generation.id;

    let first = fixture
        .engine
        .enqueue(&id, WorkKind::ApplyConfiguration { generation })
        .await
        .unwrap();
    assert_eq!(
        wait_terminal(&fixture.engine, first).await.state,
        AttemptState::Succeeded
    );

    let second = fixture
        .engine
        .enqueue(&id, WorkKind::ApplyConfiguration { generation })
        .await
        .unwrap();
    assert_eq!(
        wait_terminal(&fixture.engine, second).await.state,
        AttemptState::Succeeded
    );

    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.observed.active_generation, Some(generation));
    assert_eq!(
        *fixture.fleet.node(&id).active_generation.lock().unwrap(),
        Some(generation)
    );
}

#[tokio::test(start_paused = true)]
async fn bulk_push_isolates_per_node_failures() {
    let fixture = fixture(fast_retry(3)).await;

    let ids: Vec<NodeId> = {
        let mut ids = Vec::new();
        for i in 1..=5 {
            ids.push(register(&fixture, &format!("node-{i}")).await);
        }
        ids
    };

    // Node 3 rejects the configuration at the application level.
    fixture
        .fleet
        .node(&ids[2])
        .reject_apply
        .store(true, Ordering::SeqCst);

    // Decompose the bulk push into independent per-node attempts.
    let mut attempts = Vec::new();
    for id in &ids {
        let submission = fixture
            .registry
            .submit_configuration(id, accepted_payload(), &ValidationSchema::default())
            .await
            .unwrap()
            .unwrap();
        let attempt_id = fixture
            .engine
            .enqueue(
                id,
                WorkKind::ApplyConfiguration {
                    generation: submission.generation.id,
                },
            )
            .await
            .unwrap();
        attempts.push(attempt_id);
    }

    for (i, attempt_id) in attempts.iter().enumerate() {
        let attempt = wait_terminal(&fixture.engine, *attempt_id).await;
        if i == 2 {
            assert_eq!(attempt.state, AttemptState::Failed, "node 3 must fail");
        } else {
            assert_eq!(
                attempt.state,
                AttemptState::Succeeded,
                "node {} must not be blocked by node 3",
                i + 1
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn desired_state_is_never_mutated_by_the_engine() {
    let fixture = fixture(fast_retry(2)).await;
    let id = register(&fixture, "acme").await;

    // Interleave operator actions with reconciliation, including failures.
    let mut expected = (RunState::Stopped, None::<u64>);
    for round in 0..10u32 {
        if round % 3 == 0 {
            fixture
                .fleet
                .node(&id)
                .transport_failures
                .store(5, Ordering::SeqCst);
        } else {
            fixture
                .fleet
                .node(&id)
                .transport_failures
                .store(0, Ordering::SeqCst);
        }

        let desired = if round % 2 == 0 {
            RunState::Running
        } else {
            RunState::Stopped
        };
        fixture
            .registry
            .set_desired_run_state(&id, desired)
            .await
            .unwrap();
        expected.0 = desired;

        if round % 4 == 0 {
            let submission = fixture
                .registry
                .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
                .await
                .unwrap()
                .unwrap();
            expected.1 = Some(submission.generation.id);
        }

        let attempt_id = fixture
            .engine
            .enqueue(&id, WorkKind::SetRunState { desired })
            .await
            .unwrap();
        if round % 2 == 1 {
            wait_terminal(&fixture.engine, attempt_id).await;
        }
    }

    // Quiesce, then check the engine left desired state exactly where the
    // last operator action put it.
    if let Some(latest) = fixture.engine.latest_attempt(&id).await {
        wait_terminal(&fixture.engine, latest.id).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.desired.run_state, expected.0);
    assert_eq!(node.desired.target_generation, expected.1);
}

#[tokio::test(start_paused = true)]
async fn rollback_applies_the_earlier_generation() {
    let fixture = fixture(fast_retry(3)).await;
    let id = register(&fixture, "acme").await;

    let mut last_attempt = None;
    for _ in 0..5 {
        let submission = fixture
            .registry
            .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
            .await
            .unwrap()
            .unwrap();
        last_attempt = Some(
            fixture
                .engine
                .enqueue(
                    &id,
                    WorkKind::ApplyConfiguration {
                        generation: submission.generation.id,
                    },
                )
                .await
                .unwrap(),
        );
    }
    wait_terminal(&fixture.engine, last_attempt.unwrap()).await;

    let outcome = fixture.registry.rollback(&id, 3).await.unwrap();
    let attempt_id = fixture
        .engine
        .enqueue(
            &id,
            WorkKind::ApplyConfiguration {
                generation: outcome.generation.id,
            },
        )
        .await
        .unwrap();
    wait_terminal(&fixture.engine, attempt_id).await;

    let node = fixture.registry.get(&id).await.unwrap();
    assert_eq!(node.desired.target_generation, Some(3));
    assert_eq!(node.observed.active_generation, Some(3));
    // Generation 5 is still in the immutable history.
    assert!(node.generations.iter().any(|g| g.id == 5));
}

#[tokio::test(start_paused = true)]
async fn restart_drives_stop_then_start() {
    let fixture = fixture(fast_retry(3)).await;
    let id = register(&fixture, "acme").await;

    fixture
        .registry
        .set_desired_run_state(&id, RunState::Running)
        .await
        .unwrap();
    let attempt_id = fixture
        .engine
        .enqueue(&id, WorkKind::Restart)
        .await
        .unwrap();

    let attempt = wait_terminal(&fixture.engine, attempt_id).await;
    assert_eq!(attempt.state, AttemptState::Succeeded);
    assert_eq!(fixture.fleet.node(&id).run_state(), RunState::Running);

    // Two primary ops: stop, then start.
    let instants = fixture.fleet.node(&id).op_instants.lock().unwrap().len();
    assert_eq!(instants, 2);
}

#[tokio::test(start_paused = true)]
async fn startup_scan_re_derives_work_from_durable_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.json");

    // First controller life: accept a config push, but "crash" before the
    // node ever observed it.
    {
        let registry = Arc::new(FleetRegistry::load(FleetStore::new(path.clone())).await);
        let id = NodeId::new("acme");
        registry
            .register(
                id.clone(),
                ConnectionMeta {
                    base_url: "http://acme.internal:9100".to_string(),
                    token: "node-token".to_string(),
                    timeout_secs: 10,
                },
            )
            .await
            .unwrap();
        registry
            .submit_configuration(&id, accepted_payload(), &ValidationSchema::default())
            .await
            .unwrap()
            .unwrap();
    }

    // Second life: the engine re-derives the pending apply from disk alone.
    let registry = Arc::new(FleetRegistry::load(FleetStore::new(path)).await);
    let aggregator = Arc::new(HealthAggregator::new(HealthConfig::default()));
    let fleet = Arc::new(MockFleet::default());
    let engine = Arc::new(ReconcileEngine::new(
        registry.clone(),
        aggregator,
        fleet.clone(),
        fast_retry(3),
    ));

    engine.startup_scan().await;

    let id = NodeId::new("acme");
    let attempt = engine
        .latest_attempt(&id)
        .await
        .expect("startup scan enqueued nothing");
    let attempt = wait_terminal(&engine, attempt.id).await;
    assert_eq!(attempt.state, AttemptState::Succeeded);
    assert_eq!(*fleet.node(&id).active_generation.lock().unwrap(), Some(1));
}
