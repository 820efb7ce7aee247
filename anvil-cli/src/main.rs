//! Anvil CLI
//!
//! Quote, submit and follow training jobs on an Anvil orchestrator.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::{Config, GlobalArgs};

#[derive(Parser)]
#[command(name = "anvil")]
#[command(about = "Anvil training job CLI", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from(cli.global);

    handle_command(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "anvil",
            "cancel",
            "00000000-0000-0000-0000-000000000000",
            "--orchestrator-url",
            "http://orchestrator:9000",
            "--timeout",
            "5",
        ])
        .unwrap();

        let config = Config::from(cli.global);
        assert_eq!(config.orchestrator_url, "http://orchestrator:9000");
        assert_eq!(config.timeout, std::time::Duration::from_secs(5));
        assert!(matches!(cli.command, Commands::Cancel { .. }));
    }
}
