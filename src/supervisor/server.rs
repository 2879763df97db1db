//! Node-side supervisor daemon: the four supervisor operations over HTTP.
//!
//! Application-level rejections (invalid configuration, spawn failure, bad
//! credentials) return 4xx with a structured body; anything the controller
//! cannot reach or parse shows up client-side as a transport failure. The
//! two are never conflated.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::SupervisorConfig;
use crate::domain::generation::ConfigGeneration;
use crate::domain::node::RunState;
use crate::error::ErrorBody;
use crate::validator::{self, ValidationSchema};

use super::process::{read_log_chunk, AgentProcess};
use super::{Ack, RunStateRequest};

#[derive(Clone)]
pub struct SupervisorState {
    pub process: Arc<Mutex<AgentProcess>>,
    pub schema: Arc<ValidationSchema>,
    pub token: String,
    pub log_path: PathBuf,
}

pub fn router(state: SupervisorState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/run-state", put(set_run_state))
        .route("/v1/configuration", post(apply_configuration))
        .route("/v1/logs", get(logs))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

pub async fn run(config: SupervisorConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node_id,
        "drover supervisor starting"
    );

    let process = AgentProcess::load(&config).context("loading agent process state")?;
    let log_path = process.log_path();

    let state = SupervisorState {
        process: Arc::new(Mutex::new(process)),
        schema: Arc::new(ValidationSchema::default()),
        token: config.token.clone(),
        log_path,
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding to {}", config.http_addr))?;
    info!(addr = %config.http_addr, "supervisor API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(crate::server::shutdown_signal())
        .await
        .context("supervisor HTTP server error")?;

    info!("drover supervisor stopped");
    Ok(())
}

async fn require_token(
    State(state): State<SupervisorState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !state.token.is_empty() && token == state.token);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("unauthorized", "missing or invalid bearer token")),
        )
            .into_response()
    }
}

async fn health(State(state): State<SupervisorState>) -> Json<crate::domain::health::HealthSample> {
    Json(state.process.lock().await.sample())
}

async fn set_run_state(
    State(state): State<SupervisorState>,
    Json(request): Json<RunStateRequest>,
) -> Result<Json<Ack>, (StatusCode, Json<ErrorBody>)> {
    let mut process = state.process.lock().await;
    let result = match request.desired {
        RunState::Running => process.start().await,
        RunState::Stopped => process.stop().await,
    };

    match result {
        Ok(changed) => Ok(Json(Ack { changed })),
        Err(message) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody::new("run_state_failed", message)),
        )),
    }
}

async fn apply_configuration(
    State(state): State<SupervisorState>,
    Json(generation): Json<ConfigGeneration>,
) -> Result<Json<Ack>, (StatusCode, Json<ErrorBody>)> {
    // Validate locally before activation, with the same schema the controller
    // uses at submission time.
    let validation = validator::validate(&generation.payload, &state.schema);
    if !validation.accepted {
        let reasons: Vec<String> = validation
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.reason))
            .collect();
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody::new("invalid_configuration", reasons.join("; "))),
        ));
    }

    let process = state.process.lock().await;
    match process.activate_generation(&generation) {
        Ok(changed) => Ok(Json(Ack { changed })),
        Err(message) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody::new("activation_failed", message)),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

async fn logs(
    State(state): State<SupervisorState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<crate::domain::health::LogChunk>, (StatusCode, Json<ErrorBody>)> {
    let cursor = query.cursor.unwrap_or(0);
    let limit = query.limit.unwrap_or(200).min(1_000);

    read_log_chunk(&state.log_path, cursor, limit)
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("log_read_failed", e.to_string())),
            )
        })
}
