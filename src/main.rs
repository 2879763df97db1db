use clap::{Parser, Subcommand};

use drover::commands;
use drover::commands::fleet::FleetCommands;

#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Fleet controller and node supervisor for remote agent processes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane daemon (REST + GraphQL + reconciliation)
    Controller {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to config file (default: ~/.config/drover/controller.yaml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Run the node-side supervisor daemon
    Supervisor {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to config file (default: ~/.config/drover/supervisor.yaml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Operate on the fleet through a controller
    Fleet {
        /// Controller base URL (defaults to http://127.0.0.1:9200)
        #[arg(long, global = true)]
        controller_url: Option<String>,

        /// Operator bearer token
        #[arg(long, global = true, default_value = "")]
        token: String,

        /// Output format (table or json)
        #[arg(long, global = true, default_value = "table")]
        format: String,

        #[command(subcommand)]
        command: FleetCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller {
            http_addr,
            log_level,
            config,
        } => commands::controller::run(http_addr, log_level, config),
        Commands::Supervisor {
            http_addr,
            log_level,
            config,
        } => commands::supervisor::run(http_addr, log_level, config),
        Commands::Fleet {
            controller_url,
            token,
            format,
            command,
        } => commands::fleet::run(controller_url.as_deref(), &token, &format, &command),
    }
}
