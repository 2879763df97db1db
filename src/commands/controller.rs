use anyhow::Result;

use crate::config;

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    config_path: Option<String>,
) -> Result<()> {
    let mut controller_config = config::load_controller(config_path.as_deref())?;

    // CLI flags override config values
    if let Some(addr) = http_addr {
        controller_config.http_addr = addr;
    }
    if let Some(level) = log_level {
        controller_config.log_level = level;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(controller_config))
}
