//! Controller daemon wiring: registry, reconciliation engine, health poll
//! loop, REST + GraphQL surfaces, graceful shutdown.

use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::auth;
use crate::api::graphql::{self, DroverSchema};
use crate::api::rest::{self, AppState};
use crate::config::ControllerConfig;
use crate::domain::node::{ConnectionMeta, NodeId};
use crate::error::RegistryError;
use crate::health::{self, HealthAggregator};
use crate::reconcile::ReconcileEngine;
use crate::registry::FleetRegistry;
use crate::store::FleetStore;
use crate::supervisor::client::HttpSupervisorFactory;
use crate::validator::ValidationSchema;

pub async fn run(config: ControllerConfig) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "drover controller starting");

    // Durable fleet state
    let store = FleetStore::new(config.state_file.clone());
    let registry = Arc::new(FleetRegistry::load(store).await);

    if let Some(seed) = &config.seed_file {
        seed_fleet(&registry, seed).await;
    }

    let aggregator = Arc::new(HealthAggregator::new(config.health.clone()));
    let supervisors =
        Arc::new(HttpSupervisorFactory::new().context("building supervisor HTTP client")?);

    let engine = Arc::new(ReconcileEngine::new(
        registry.clone(),
        aggregator.clone(),
        supervisors.clone(),
        config.retry.clone(),
    ));

    // Re-derive in-flight work from durable desired vs. observed state.
    engine.startup_scan().await;

    // Health poll loop
    {
        let registry = registry.clone();
        let supervisors = supervisors.clone();
        let aggregator = aggregator.clone();
        let health_config = config.health.clone();
        tokio::spawn(async move {
            health::run_poll_loop(registry, supervisors, aggregator, health_config).await;
        });
    }

    let tokens = auth::operator_tokens(&config.operators);
    if tokens.is_empty() {
        warn!("no operator tokens configured, every control API request will be rejected");
    }

    let app_state = AppState {
        registry: registry.clone(),
        engine: engine.clone(),
        health: aggregator.clone(),
        supervisors,
        schema: Arc::new(ValidationSchema::default()),
    };

    // GraphQL status surface, behind the same bearer auth as REST
    let schema = graphql::build_schema(registry.clone(), engine, aggregator);
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .layer(middleware::from_fn_with_state(
            tokens.clone(),
            auth::require_operator,
        ))
        .with_state(schema);

    // Unauthenticated liveness probe
    let liveness_router = Router::new()
        .route("/health", get(liveness))
        .with_state(registry.clone());

    let app = rest::router(app_state, tokens)
        .merge(graphql_router)
        .merge(liveness_router)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding to {}", config.http_addr))?;

    info!(addr = %config.http_addr, "control API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("drover controller stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    nodes: Vec<SeedNode>,
}

#[derive(Debug, Deserialize)]
struct SeedNode {
    identity: String,
    base_url: String,
    token: String,
    #[serde(default = "default_seed_timeout")]
    timeout_secs: u64,
}

fn default_seed_timeout() -> u64 {
    10
}

/// Register nodes from a YAML seed file. Already-known identities are
/// skipped, never overwritten.
async fn seed_fleet(registry: &FleetRegistry, path: &Path) {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read fleet seed file");
            return;
        }
    };

    let seed: SeedFile = match serde_yaml::from_str(&content) {
        Ok(seed) => seed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot parse fleet seed file");
            return;
        }
    };

    for node in seed.nodes {
        let identity = NodeId::new(node.identity);
        let connection = ConnectionMeta {
            base_url: node.base_url,
            token: node.token,
            timeout_secs: node.timeout_secs,
        };

        match registry.register(identity.clone(), connection).await {
            Ok(_) => info!(node = %identity, "seeded fleet node"),
            Err(RegistryError::DuplicateNode(_)) => {}
            Err(e) => warn!(node = %identity, error = %e, "failed to seed fleet node"),
        }
    }
}

async fn liveness(State(registry): State<Arc<FleetRegistry>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "total_nodes": registry.list().await.len(),
    }))
}

async fn graphql_playground() -> Html<String> {
    Html(async_graphql::http::playground_source(
        async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
    ))
}

async fn graphql_handler(
    State(schema): State<DroverSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
