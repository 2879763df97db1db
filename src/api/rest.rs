//! REST control API consumed by operator tooling.
//!
//! Synchronous registry/validation errors return directly with no side
//! effects; accepted desired-state changes return 202 with an attempt id
//! once durably recorded, and reconciliation outcomes surface through the
//! status endpoints, never through the enqueueing request.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::domain::attempt::{AttemptView, WorkKind};
use crate::domain::generation::{ConfigGeneration, FieldError};
use crate::domain::health::LogChunk;
use crate::domain::node::{ConnectionMeta, DesiredState, Node, NodeId, RunState};
use crate::domain::status::{FleetOverview, NodeStatus};
use crate::error::{ErrorBody, RegistryError, SupervisorError};
use crate::health::HealthAggregator;
use crate::reconcile::ReconcileEngine;
use crate::registry::FleetRegistry;
use crate::supervisor::SupervisorFactory;
use crate::validator::ValidationSchema;

use super::auth::{self, OperatorIdentity, OperatorTokens};

/// Shared application state for all control API handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FleetRegistry>,
    pub engine: Arc<ReconcileEngine>,
    pub health: Arc<HealthAggregator>,
    pub supervisors: Arc<dyn SupervisorFactory>,
    pub schema: Arc<ValidationSchema>,
}

pub fn router(state: AppState, tokens: OperatorTokens) -> Router {
    Router::new()
        .route("/api/v1/nodes", post(register_node))
        .route("/api/v1/nodes/{id}", delete(deregister_node))
        .route("/api/v1/nodes/{id}/configuration", put(push_configuration))
        .route(
            "/api/v1/nodes/{id}/configuration/rollback",
            post(rollback_configuration),
        )
        .route("/api/v1/nodes/{id}/generations", get(generations))
        .route("/api/v1/nodes/{id}/run-state", post(set_run_state))
        .route("/api/v1/nodes/{id}/restart", post(restart_node))
        .route("/api/v1/nodes/{id}/status", get(node_status))
        .route("/api/v1/nodes/{id}/logs", get(node_logs))
        .route("/api/v1/nodes/{id}/attempts/{attempt_id}", get(attempt))
        .route("/api/v1/fleet/status", get(fleet_status))
        .route("/api/v1/fleet/overview", get(fleet_overview))
        .route("/api/v1/fleet/actions", post(bulk_actions))
        .route("/api/v1/fleet/configuration", post(bulk_configuration))
        .layer(middleware::from_fn_with_state(tokens, auth::require_operator))
        .with_state(state)
}

// ── Wire types ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub identity: String,
    pub connection: ConnectionMeta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunStateChange {
    pub desired: RunState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub generation_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Enqueued {
    pub attempt_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigAccepted {
    pub generation_id: u64,
    pub attempt_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationRejection {
    pub code: String,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkActionRequest {
    pub node_ids: Vec<String>,
    pub action: BulkAction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkActionItem {
    pub node_id: String,
    pub attempt_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkConfigRequest {
    pub node_ids: Vec<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkConfigItem {
    pub node_id: String,
    pub generation_id: Option<u64>,
    pub attempt_id: Option<String>,
    pub validation_errors: Option<Vec<FieldError>>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::DuplicateNode(_) | RegistryError::NodePreconditionFailed { .. } => {
            StatusCode::CONFLICT
        }
        RegistryError::UnknownNode(_) | RegistryError::UnknownGeneration { .. } => {
            StatusCode::NOT_FOUND
        }
        RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::new(e.code(), e.to_string())))
}

fn audit(
    operator: &OperatorIdentity,
    node: &NodeId,
    action: &str,
    previous: &DesiredState,
    desired: &DesiredState,
) {
    info!(
        target: "audit",
        operator = %operator.0,
        node = %node,
        action,
        previous_run_state = %previous.run_state,
        previous_target_generation = previous.target_generation,
        new_run_state = %desired.run_state,
        new_target_generation = desired.target_generation,
        "desired state changed"
    );
}

// ── Node lifecycle ─────────────────────────────────────────

async fn register_node(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    let identity = NodeId::new(request.identity);
    let node = state
        .registry
        .register(identity.clone(), request.connection)
        .await
        .map_err(registry_error)?;

    info!(target: "audit", operator = %operator.0, node = %identity, "node registered");
    Ok((StatusCode::CREATED, Json(node)))
}

async fn deregister_node(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = NodeId::new(id);
    state
        .registry
        .deregister(&identity)
        .await
        .map_err(registry_error)?;

    state.engine.forget_node(&identity).await;
    state.health.forget(&identity).await;

    info!(target: "audit", operator = %operator.0, node = %identity, "node deregistered");
    Ok(StatusCode::NO_CONTENT)
}

// ── Configuration ──────────────────────────────────────────

async fn push_configuration(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Path(id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ConfigAccepted>), Response> {
    let identity = NodeId::new(id);

    let submission = state
        .registry
        .submit_configuration(&identity, payload, &state.schema)
        .await
        .map_err(|e| registry_error(e).into_response())?
        .map_err(|validation| {
            (
                StatusCode::BAD_REQUEST,
                Json(ValidationRejection {
                    code: "validation_rejected".to_string(),
                    errors: validation.errors,
                }),
            )
                .into_response()
        })?;

    audit(
        &operator,
        &identity,
        "push_configuration",
        &submission.previous,
        &submission.desired,
    );

    let attempt_id = state
        .engine
        .enqueue(
            &identity,
            WorkKind::ApplyConfiguration {
                generation: submission.generation.id,
            },
        )
        .await
        .map_err(|e| registry_error(e).into_response())?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ConfigAccepted {
            generation_id: submission.generation.id,
            attempt_id: attempt_id.to_string(),
        }),
    ))
}

async fn rollback_configuration(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<(StatusCode, Json<ConfigAccepted>), ApiError> {
    let identity = NodeId::new(id);

    let outcome = state
        .registry
        .rollback(&identity, request.generation_id)
        .await
        .map_err(registry_error)?;

    audit(
        &operator,
        &identity,
        "rollback_configuration",
        &outcome.previous,
        &outcome.desired,
    );

    let attempt_id = state
        .engine
        .enqueue(
            &identity,
            WorkKind::ApplyConfiguration {
                generation: outcome.generation.id,
            },
        )
        .await
        .map_err(registry_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ConfigAccepted {
            generation_id: outcome.generation.id,
            attempt_id: attempt_id.to_string(),
        }),
    ))
}

async fn generations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ConfigGeneration>>, ApiError> {
    state
        .registry
        .generations(&NodeId::new(id))
        .await
        .map(Json)
        .map_err(registry_error)
}

// ── Run state ──────────────────────────────────────────────

async fn set_run_state(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Path(id): Path<String>,
    Json(request): Json<RunStateChange>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let identity = NodeId::new(id);

    let (previous, desired) = state
        .registry
        .set_desired_run_state(&identity, request.desired)
        .await
        .map_err(registry_error)?;

    audit(&operator, &identity, "set_run_state", &previous, &desired);

    let attempt_id = state
        .engine
        .enqueue(
            &identity,
            WorkKind::SetRunState {
                desired: request.desired,
            },
        )
        .await
        .map_err(registry_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Enqueued {
            attempt_id: attempt_id.to_string(),
        }),
    ))
}

async fn restart_node(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let identity = NodeId::new(id);

    // A restart means the operator wants the process up afterwards.
    let (previous, desired) = state
        .registry
        .set_desired_run_state(&identity, RunState::Running)
        .await
        .map_err(registry_error)?;

    audit(&operator, &identity, "restart", &previous, &desired);

    let attempt_id = state
        .engine
        .enqueue(&identity, WorkKind::Restart)
        .await
        .map_err(registry_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Enqueued {
            attempt_id: attempt_id.to_string(),
        }),
    ))
}

// ── Status ─────────────────────────────────────────────────

async fn node_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeStatus>, ApiError> {
    let node = state
        .registry
        .get(&NodeId::new(id))
        .await
        .map_err(registry_error)?;

    Ok(Json(
        super::build_node_status(&node, &state.health, &state.engine).await,
    ))
}

async fn fleet_status(State(state): State<AppState>) -> Json<Vec<NodeStatus>> {
    let mut statuses = Vec::new();
    for node in state.registry.list().await {
        statuses.push(super::build_node_status(&node, &state.health, &state.engine).await);
    }
    Json(statuses)
}

async fn fleet_overview(State(state): State<AppState>) -> Json<FleetOverview> {
    Json(super::build_overview(&state.registry, &state.health, &state.engine).await)
}

async fn attempt(
    State(state): State<AppState>,
    Path((_id, attempt_id)): Path<(String, String)>,
) -> Result<Json<AttemptView>, ApiError> {
    let parsed = attempt_id.parse::<Uuid>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("invalid_attempt_id", "not a UUID")),
        )
    })?;

    state
        .engine
        .attempt(&parsed)
        .await
        .map(|a| Json(AttemptView::from(&a)))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorBody::new("unknown_attempt", "no such attempt")),
            )
        })
}

// ── Logs proxy ─────────────────────────────────────────────

async fn node_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogChunk>, ApiError> {
    let node = state
        .registry
        .get(&NodeId::new(id))
        .await
        .map_err(registry_error)?;

    let supervisor = state.supervisors.supervisor_for(&node);
    supervisor
        .fetch_logs(query.cursor.unwrap_or(0), query.limit.unwrap_or(200))
        .await
        .map(Json)
        .map_err(|e| match e {
            SupervisorError::Transport(message) => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::new("transport_failure", message)),
            ),
            SupervisorError::Rejected { code, message } => {
                (StatusCode::BAD_GATEWAY, Json(ErrorBody::new(code, message)))
            }
        })
}

// ── Bulk operations ────────────────────────────────────────

/// Bulk actions decompose into independent per-node attempts; one node's
/// failure never blocks or rolls back another's.
async fn bulk_actions(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Json(request): Json<BulkActionRequest>,
) -> (StatusCode, Json<Vec<BulkActionItem>>) {
    let mut results = Vec::with_capacity(request.node_ids.len());

    for id in request.node_ids {
        let identity = NodeId::new(id.clone());
        let outcome = apply_action(&state, &operator, &identity, request.action).await;
        results.push(match outcome {
            Ok(attempt_id) => BulkActionItem {
                node_id: id,
                attempt_id: Some(attempt_id.to_string()),
                error: None,
            },
            Err(e) => BulkActionItem {
                node_id: id,
                attempt_id: None,
                error: Some(e.to_string()),
            },
        });
    }

    (StatusCode::ACCEPTED, Json(results))
}

async fn apply_action(
    state: &AppState,
    operator: &OperatorIdentity,
    identity: &NodeId,
    action: BulkAction,
) -> Result<Uuid, RegistryError> {
    let (run_state, kind, name) = match action {
        BulkAction::Start => (
            RunState::Running,
            WorkKind::SetRunState {
                desired: RunState::Running,
            },
            "start",
        ),
        BulkAction::Stop => (
            RunState::Stopped,
            WorkKind::SetRunState {
                desired: RunState::Stopped,
            },
            "stop",
        ),
        BulkAction::Restart => (RunState::Running, WorkKind::Restart, "restart"),
    };

    let (previous, desired) = state
        .registry
        .set_desired_run_state(identity, run_state)
        .await?;
    audit(operator, identity, name, &previous, &desired);

    state.engine.enqueue(identity, kind).await
}

async fn bulk_configuration(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorIdentity>,
    Json(request): Json<BulkConfigRequest>,
) -> (StatusCode, Json<Vec<BulkConfigItem>>) {
    let mut results = Vec::with_capacity(request.node_ids.len());

    for id in request.node_ids {
        let identity = NodeId::new(id.clone());
        let item = push_one(&state, &operator, &identity, request.payload.clone()).await;
        results.push(BulkConfigItem {
            node_id: id,
            ..item
        });
    }

    (StatusCode::ACCEPTED, Json(results))
}

async fn push_one(
    state: &AppState,
    operator: &OperatorIdentity,
    identity: &NodeId,
    payload: serde_json::Value,
) -> BulkConfigItem {
    let empty = BulkConfigItem {
        node_id: String::new(),
        generation_id: None,
        attempt_id: None,
        validation_errors: None,
        error: None,
    };

    let submission = match state
        .registry
        .submit_configuration(identity, payload, &state.schema)
        .await
    {
        Ok(Ok(submission)) => submission,
        Ok(Err(validation)) => {
            return BulkConfigItem {
                validation_errors: Some(validation.errors),
                ..empty
            }
        }
        Err(e) => {
            return BulkConfigItem {
                error: Some(e.to_string()),
                ..empty
            }
        }
    };

    audit(
        operator,
        identity,
        "push_configuration",
        &submission.previous,
        &submission.desired,
    );

    match state
        .engine
        .enqueue(
            identity,
            WorkKind::ApplyConfiguration {
                generation: submission.generation.id,
            },
        )
        .await
    {
        Ok(attempt_id) => BulkConfigItem {
            generation_id: Some(submission.generation.id),
            attempt_id: Some(attempt_id.to_string()),
            ..empty
        },
        Err(e) => BulkConfigItem {
            generation_id: Some(submission.generation.id),
            error: Some(e.to_string()),
            ..empty
        },
    }
}
