//! Typed HTTP client for the node-side supervisor API.
//!
//! Transport failures (connect, timeout, malformed replies) and application
//! rejections (4xx with a structured error body) map to the two
//! [`SupervisorError`] variants so the reconciliation engine can tell
//! retryable from fatal. A 5xx is treated as transient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};

use crate::domain::generation::ConfigGeneration;
use crate::domain::health::{HealthSample, LogChunk};
use crate::domain::node::{ConnectionMeta, Node, RunState};
use crate::error::{ErrorBody, SupervisorError};

use super::{Ack, AgentSupervisor, RunStateRequest, SupervisorFactory};

pub struct HttpSupervisor {
    http: Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpSupervisor {
    pub fn new(http: Client, connection: &ConnectionMeta) -> Self {
        Self {
            http,
            base_url: connection.base_url.trim_end_matches('/').to_string(),
            token: connection.token.clone(),
            timeout: Duration::from_secs(connection.timeout_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SupervisorError> {
        let response = request
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SupervisorError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ErrorBody>().await.unwrap_or_else(|_| {
            ErrorBody::new(format!("http_{}", status.as_u16()), status.to_string())
        });

        if status.is_client_error() {
            Err(SupervisorError::Rejected {
                code: body.code,
                message: body.message,
            })
        } else {
            Err(SupervisorError::Transport(format!(
                "{} replied {}: {}",
                self.base_url, status, body.message
            )))
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, SupervisorError> {
        response
            .json()
            .await
            .map_err(|e| SupervisorError::Transport(format!("parsing supervisor reply: {e}")))
    }
}

#[async_trait]
impl AgentSupervisor for HttpSupervisor {
    async fn apply_configuration(
        &self,
        generation: &ConfigGeneration,
    ) -> Result<Ack, SupervisorError> {
        let response = self
            .send(self.http.post(self.url("/v1/configuration")).json(generation))
            .await?;
        self.parse(response).await
    }

    async fn set_run_state(&self, desired: RunState) -> Result<Ack, SupervisorError> {
        let response = self
            .send(
                self.http
                    .put(self.url("/v1/run-state"))
                    .json(&RunStateRequest { desired }),
            )
            .await?;
        self.parse(response).await
    }

    async fn sample_health(&self) -> Result<HealthSample, SupervisorError> {
        let response = self.send(self.http.get(self.url("/v1/health"))).await?;
        self.parse(response).await
    }

    async fn fetch_logs(&self, cursor: u64, limit: usize) -> Result<LogChunk, SupervisorError> {
        let response = self
            .send(
                self.http
                    .get(self.url("/v1/logs"))
                    .query(&[("cursor", cursor.to_string()), ("limit", limit.to_string())]),
            )
            .await?;
        self.parse(response).await
    }
}

/// Production factory: one shared connection pool, per-node base URL, token
/// and timeout from the registry's connection metadata.
pub struct HttpSupervisorFactory {
    http: Client,
}

impl HttpSupervisorFactory {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().build()?,
        })
    }
}

impl SupervisorFactory for HttpSupervisorFactory {
    fn supervisor_for(&self, node: &Node) -> Arc<dyn AgentSupervisor> {
        Arc::new(HttpSupervisor::new(self.http.clone(), &node.connection))
    }
}
