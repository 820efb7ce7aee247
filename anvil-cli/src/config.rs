//! Connection settings shared by every command

use anvil_client::OrchestratorClient;
use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;

/// Flags that apply to every subcommand
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Orchestrator URL
    #[arg(
        long,
        global = true,
        env = "ANVIL_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    pub orchestrator_url: String,

    /// Seconds before a request to the orchestrator is abandoned
    #[arg(long, global = true, env = "ANVIL_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout: u64,
}

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub orchestrator_url: String,
    pub timeout: Duration,
}

impl From<GlobalArgs> for Config {
    fn from(args: GlobalArgs) -> Self {
        Self {
            orchestrator_url: args.orchestrator_url,
            timeout: Duration::from_secs(args.timeout.max(1)),
        }
    }
}

impl Config {
    /// Client bound to the configured orchestrator
    pub fn client(&self) -> Result<OrchestratorClient> {
        OrchestratorClient::with_timeout(&self.orchestrator_url, self.timeout)
            .with_context(|| format!("Failed to build client for {}", self.orchestrator_url))
    }
}
