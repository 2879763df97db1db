//! Typed HTTP client for the drover controller REST API.

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::rest::{
    BulkAction, BulkActionItem, BulkActionRequest, BulkConfigItem, BulkConfigRequest,
    ConfigAccepted, Enqueued, RegisterRequest, RollbackRequest, RunStateChange,
};
use crate::domain::attempt::AttemptView;
use crate::domain::generation::ConfigGeneration;
use crate::domain::health::LogChunk;
use crate::domain::node::{ConnectionMeta, Node, RunState};
use crate::domain::status::{FleetOverview, NodeStatus};
use crate::error::ErrorBody;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9200";

pub struct ControllerClient {
    base_url: String,
    token: String,
    http: Client,
}

impl ControllerClient {
    pub fn new(base_url: Option<&str>, token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            token: token.to_string(),
            http,
        })
    }

    pub async fn register(
        &self,
        identity: &str,
        connection: ConnectionMeta,
    ) -> Result<Node> {
        self.send_json(
            Method::POST,
            "/api/v1/nodes",
            &RegisterRequest {
                identity: identity.to_string(),
                connection,
            },
        )
        .await
    }

    pub async fn deregister(&self, identity: &str) -> Result<()> {
        let url = format!("{}/api/v1/nodes/{}", self.base_url, identity);
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("DELETE {url}"))?;

        if !resp.status().is_success() {
            bail_with_body(&url, resp).await?;
        }
        Ok(())
    }

    pub async fn fleet_status(&self) -> Result<Vec<NodeStatus>> {
        self.get("/api/v1/fleet/status").await
    }

    pub async fn overview(&self) -> Result<FleetOverview> {
        self.get("/api/v1/fleet/overview").await
    }

    pub async fn node_status(&self, identity: &str) -> Result<NodeStatus> {
        self.get(&format!("/api/v1/nodes/{identity}/status")).await
    }

    pub async fn generations(&self, identity: &str) -> Result<Vec<ConfigGeneration>> {
        self.get(&format!("/api/v1/nodes/{identity}/generations"))
            .await
    }

    pub async fn push_configuration(
        &self,
        identity: &str,
        payload: serde_json::Value,
    ) -> Result<ConfigAccepted> {
        self.send_json(
            Method::PUT,
            &format!("/api/v1/nodes/{identity}/configuration"),
            &payload,
        )
        .await
    }

    pub async fn rollback(&self, identity: &str, generation_id: u64) -> Result<ConfigAccepted> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/nodes/{identity}/configuration/rollback"),
            &RollbackRequest { generation_id },
        )
        .await
    }

    pub async fn set_run_state(&self, identity: &str, desired: RunState) -> Result<Enqueued> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/nodes/{identity}/run-state"),
            &RunStateChange { desired },
        )
        .await
    }

    pub async fn restart(&self, identity: &str) -> Result<Enqueued> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/nodes/{identity}/restart"),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn attempt(&self, identity: &str, attempt_id: &str) -> Result<AttemptView> {
        self.get(&format!("/api/v1/nodes/{identity}/attempts/{attempt_id}"))
            .await
    }

    pub async fn logs(&self, identity: &str, cursor: u64, limit: usize) -> Result<LogChunk> {
        self.get(&format!(
            "/api/v1/nodes/{identity}/logs?cursor={cursor}&limit={limit}"
        ))
        .await
    }

    pub async fn bulk_action(
        &self,
        node_ids: Vec<String>,
        action: BulkAction,
    ) -> Result<Vec<BulkActionItem>> {
        self.send_json(
            Method::POST,
            "/api/v1/fleet/actions",
            &BulkActionRequest { node_ids, action },
        )
        .await
    }

    pub async fn bulk_configuration(
        &self,
        node_ids: Vec<String>,
        payload: serde_json::Value,
    ) -> Result<Vec<BulkConfigItem>> {
        self.send_json(
            Method::POST,
            "/api/v1/fleet/configuration",
            &BulkConfigRequest { node_ids, payload },
        )
        .await
    }

    // ── Internal helpers ───────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if !resp.status().is_success() {
            return bail_with_body(&url, resp).await;
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {url}"))
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let request: RequestBuilder = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token)
            .json(body);

        let resp = request
            .send()
            .await
            .with_context(|| format!("{method} {url}"))?;

        if !resp.status().is_success() {
            return bail_with_body(&url, resp).await;
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {url}"))
    }
}

async fn bail_with_body<T>(url: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("{url} returned {status}: {} ({})", body.message, body.code),
        Err(_) => bail!("{url} returned {status}"),
    }
}
