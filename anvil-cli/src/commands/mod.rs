//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;

pub use job::{JobShape, SubmitArgs};

use anyhow::Result;
use clap::Subcommand;
use uuid::Uuid;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show the routing decision and estimate without submitting
    Quote {
        #[command(flatten)]
        shape: JobShape,
    },
    /// Submit a training job
    Submit(SubmitArgs),
    /// Get job details
    Get {
        /// Job ID
        id: Uuid,
    },
    /// List the jobs of a project
    List {
        /// Project ID
        project: String,
    },
    /// Reconcile a job now and print its state
    Poll {
        /// Job ID
        id: Uuid,

        /// Project the job belongs to
        #[arg(long)]
        project: String,
    },
    /// Cancel a job and delete its worker
    Cancel {
        /// Job ID
        id: Uuid,
    },
    /// Poll a job until it finishes
    Watch {
        /// Job ID
        id: Uuid,

        /// Project the job belongs to
        #[arg(long)]
        project: String,

        /// Seconds between polls
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = config.client()?;

    match command {
        Commands::Quote { shape } => job::quote(&client, shape).await,
        Commands::Submit(args) => job::submit(&client, args).await,
        Commands::Get { id } => job::get(&client, id).await,
        Commands::List { project } => job::list(&client, &project).await,
        Commands::Poll { id, project } => job::poll(&client, id, &project).await,
        Commands::Cancel { id } => job::cancel(&client, id).await,
        Commands::Watch {
            id,
            project,
            interval,
        } => job::watch(&client, id, &project, interval).await,
    }
}
