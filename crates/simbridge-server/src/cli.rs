use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use simbridge_types::BridgeConfig;

#[derive(Parser, Debug)]
#[command(name = "simbridge", about = "Bridge between the market simulation engine and the validator")]
pub struct Cli {
    /// Bridge config file (TOML); defaults apply when it does not exist
    #[arg(long, short, env = "SIMBRIDGE_CONFIG", default_value = "simbridge.toml")]
    pub config: PathBuf,

    /// Simulation config file, overriding the one named in the bridge config
    #[arg(long, env = "SIMBRIDGE_SIMULATION_CONFIG")]
    pub simulation_config: Option<PathBuf>,

    /// Ignore saved checkpoints and start from empty state
    #[arg(long)]
    pub reset: bool,

    /// Port of the notification endpoint
    #[arg(long, env = "SIMBRIDGE_HTTP_PORT")]
    pub port: Option<u16>,

    /// Do not publish step reports
    #[arg(long)]
    pub no_report: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Load the bridge config and apply command-line overrides.
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::load(&self.config)
            .with_context(|| format!("failed to load bridge config {}", self.config.display()))?;
        if let Some(path) = &self.simulation_config {
            config.simulation_config = path.display().to_string();
        }
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if self.no_report {
            config.reporting_disabled = true;
        }
        Ok(config)
    }
}
