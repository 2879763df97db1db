//! Daemon configuration: built-in defaults, an optional YAML file, then
//! `DROVER_*` environment overrides, merged with figment.
//!
//! Retry and health constants live here rather than in code so deployments
//! can tune them and tests can inject millisecond-scale values.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Control-plane daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub http_addr: String,
    pub log_level: String,
    /// Durable fleet state (registry + generations).
    pub state_file: PathBuf,
    /// Optional YAML fleet seed registered at startup.
    pub seed_file: Option<PathBuf>,
    /// Operator bearer tokens accepted by the control API.
    #[serde(default)]
    pub operators: Vec<OperatorToken>,
    pub retry: RetryConfig,
    pub health: HealthConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9200".to_string(),
            log_level: "info".to_string(),
            state_file: data_dir().join("fleet.json"),
            seed_file: None,
            operators: Vec::new(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// One accepted operator credential. Every control API request resolves to
/// the operator name for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorToken {
    pub name: String,
    pub token: String,
}

/// Reconciliation retry policy: exponential backoff with a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Bounded jitter factor in [0, 1]. Kept at or below 1.0 so delays stay
    /// non-decreasing below the ceiling.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

/// Health aggregation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub poll_interval_secs: u64,
    /// A node with no sample inside this threshold classifies unreachable.
    pub freshness_secs: u64,
    /// Sliding window length per node.
    pub window_size: usize,
    pub cpu_threshold_percent: f64,
    pub memory_threshold_percent: f64,
    /// Bounded timeout for one health sample call.
    pub sample_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            freshness_secs: 45,
            window_size: 20,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            sample_timeout_secs: 5,
        }
    }
}

/// Node-side supervisor daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub http_addr: String,
    pub log_level: String,
    /// This node's identity as registered with the controller.
    pub node_id: String,
    /// Bearer token the controller must present.
    pub token: String,
    /// Directory for the status file, active generation, agent config and
    /// agent log.
    pub state_dir: PathBuf,
    pub agent: AgentConfig,
    /// Seconds between SIGTERM and hard kill on stop.
    pub stop_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9100".to_string(),
            log_level: "info".to_string(),
            node_id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unnamed-node".to_string()),
            token: String::new(),
            state_dir: data_dir().join("supervisor"),
            agent: AgentConfig::default(),
            stop_grace_secs: 5,
        }
    }
}

/// The supervised unit: an opaque command the supervisor spawns and signals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

pub fn load_controller(path: Option<&str>) -> Result<ControllerConfig> {
    load(path, "controller.yaml")
}

pub fn load_supervisor(path: Option<&str>) -> Result<SupervisorConfig> {
    load(path, "supervisor.yaml")
}

fn load<T>(path: Option<&str>, default_name: &str) -> Result<T>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => config_dir().join(default_name),
    };

    let mut figment = Figment::from(Serialized::defaults(T::default()));
    if path.exists() {
        figment = figment.merge(Yaml::file(&path));
    }

    figment
        .merge(Env::prefixed("DROVER_").split("__"))
        .extract()
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drover")
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drover")
}
