use anyhow::Result;

use crate::config;

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    config_path: Option<String>,
) -> Result<()> {
    let mut supervisor_config = config::load_supervisor(config_path.as_deref())?;

    if let Some(addr) = http_addr {
        supervisor_config.http_addr = addr;
    }
    if let Some(level) = log_level {
        supervisor_config.log_level = level;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::supervisor::server::run(supervisor_config))
}
