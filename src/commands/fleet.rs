//! `drover fleet …` — operator commands against the controller REST API.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;

use crate::client::ControllerClient;
use crate::domain::health::HealthClass;
use crate::domain::node::{ConnectionMeta, RunState};
use crate::domain::status::NodeStatus;

#[derive(Subcommand)]
pub enum FleetCommands {
    /// Show desired/observed state and health for every node
    Status,

    /// Aggregate fleet counters
    Overview,

    /// Register a node with the controller
    Register {
        /// Node identity (unique, immutable)
        identity: String,

        /// Base URL of the node's supervisor API
        #[arg(long)]
        base_url: String,

        /// Bearer token for the node's supervisor
        #[arg(long)]
        node_token: String,

        /// Supervisor request timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Deregister a fully stopped node
    Deregister {
        identity: String,
    },

    /// Validate and push a configuration payload from a JSON file
    PushConfig {
        identity: String,

        /// Path to the JSON payload
        #[arg(long)]
        file: String,
    },

    /// Re-target an earlier configuration generation
    Rollback {
        identity: String,

        #[arg(long)]
        generation: u64,
    },

    /// Show the configuration generation history
    Generations {
        identity: String,
    },

    /// Change a node's desired run state
    RunState {
        identity: String,

        /// running or stopped
        #[arg(long)]
        desired: String,
    },

    /// Restart a node's agent process
    Restart {
        identity: String,
    },

    /// Poll a reconciliation attempt
    Attempt {
        identity: String,
        attempt_id: String,
    },

    /// Fetch agent logs through the controller
    Logs {
        identity: String,

        #[arg(long, default_value_t = 0)]
        cursor: u64,

        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

pub fn run(
    controller_url: Option<&str>,
    token: &str,
    format: &str,
    command: &FleetCommands,
) -> Result<()> {
    let client = ControllerClient::new(controller_url, token)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(&client, format, command))
}

async fn dispatch(client: &ControllerClient, format: &str, command: &FleetCommands) -> Result<()> {
    match command {
        FleetCommands::Status => {
            let statuses = client.fleet_status().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_status_table(&statuses);
            }
        }

        FleetCommands::Overview => {
            let overview = client.overview().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&overview)?);
            } else {
                println!("{}", "Fleet Overview".bold());
                println!("  nodes:            {}", overview.total_nodes);
                println!("  desired running:  {}", overview.desired_running);
                println!("  observed running: {}", overview.observed_running);
                println!(
                    "  health:           {} healthy / {} degraded / {} unreachable",
                    overview.healthy.to_string().green(),
                    overview.degraded.to_string().yellow(),
                    overview.unreachable.to_string().red()
                );
                println!("  failed attempts:  {}", overview.failed_attempts);
            }
        }

        FleetCommands::Register {
            identity,
            base_url,
            node_token,
            timeout_secs,
        } => {
            let node = client
                .register(
                    identity,
                    ConnectionMeta {
                        base_url: base_url.clone(),
                        token: node_token.clone(),
                        timeout_secs: *timeout_secs,
                    },
                )
                .await?;
            println!(
                "{} Registered {} ({})",
                "ok".green().bold(),
                node.identity.as_str().bold(),
                node.connection.base_url.dimmed()
            );
        }

        FleetCommands::Deregister { identity } => {
            client.deregister(identity).await?;
            println!("{} Deregistered {}", "ok".green().bold(), identity.bold());
        }

        FleetCommands::PushConfig { identity, file } => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("reading payload file {file}"))?;
            let payload: serde_json::Value =
                serde_json::from_str(&content).with_context(|| format!("parsing {file}"))?;

            let accepted = client.push_configuration(identity, payload).await?;
            println!(
                "{} Generation {} accepted for {} (attempt {})",
                "ok".green().bold(),
                accepted.generation_id,
                identity.bold(),
                accepted.attempt_id.dimmed()
            );
        }

        FleetCommands::Rollback {
            identity,
            generation,
        } => {
            let accepted = client.rollback(identity, *generation).await?;
            println!(
                "{} Re-targeted generation {} for {} (attempt {})",
                "ok".green().bold(),
                accepted.generation_id,
                identity.bold(),
                accepted.attempt_id.dimmed()
            );
        }

        FleetCommands::Generations { identity } => {
            let generations = client.generations(identity).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&generations)?);
            } else {
                println!("{}", format!("Generations for {identity}").bold());
                for g in &generations {
                    println!(
                        "  {:>4}  {}  {}",
                        g.id,
                        g.created_at.format("%Y-%m-%d %H:%M:%S"),
                        if g.validation.accepted {
                            "accepted".green()
                        } else {
                            "rejected".red()
                        }
                    );
                }
            }
        }

        FleetCommands::RunState { identity, desired } => {
            let desired = match desired.as_str() {
                "running" => RunState::Running,
                "stopped" => RunState::Stopped,
                other => bail!("invalid run state '{other}' (use running or stopped)"),
            };
            let enqueued = client.set_run_state(identity, desired).await?;
            println!(
                "{} Desired state recorded for {} (attempt {})",
                "ok".green().bold(),
                identity.bold(),
                enqueued.attempt_id.dimmed()
            );
        }

        FleetCommands::Restart { identity } => {
            let enqueued = client.restart(identity).await?;
            println!(
                "{} Restart enqueued for {} (attempt {})",
                "ok".green().bold(),
                identity.bold(),
                enqueued.attempt_id.dimmed()
            );
        }

        FleetCommands::Attempt {
            identity,
            attempt_id,
        } => {
            let attempt = client.attempt(identity, attempt_id).await?;
            println!("{}", serde_json::to_string_pretty(&attempt)?);
        }

        FleetCommands::Logs {
            identity,
            cursor,
            limit,
        } => {
            let chunk = client.logs(identity, *cursor, *limit).await?;
            for line in &chunk.lines {
                println!("{line}");
            }
            eprintln!("{}", format!("next cursor: {}", chunk.next_cursor).dimmed());
        }
    }

    Ok(())
}

fn print_status_table(statuses: &[NodeStatus]) {
    if statuses.is_empty() {
        println!("{} No nodes registered", "::".blue().bold());
        return;
    }

    println!("{}", "Fleet Status".bold());
    println!();

    for status in statuses {
        let health = match status.health {
            HealthClass::Healthy => "healthy".green().bold(),
            HealthClass::Degraded => "degraded".yellow().bold(),
            HealthClass::Unreachable => "unreachable".red().bold(),
        };

        let attempt = status
            .attempt
            .as_ref()
            .map(|a| format!("{:?}", a.state).to_lowercase())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "  {} {}  desired={}/gen {}  observed={}/gen {}  attempt={}",
            health,
            status.identity.as_str().bold(),
            status.desired.run_state,
            status
                .desired
                .target_generation
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.observed.run_state,
            status
                .observed
                .active_generation
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempt.dimmed()
        );
    }

    println!();
}
