//! Job command handlers
//!
//! Handles quoting, submission, inspection, polling, cancellation and
//! watching of training jobs.

use anvil_client::OrchestratorClient;
use anvil_core::domain::job::{HyperParameters, JobRecord, JobStatus};
use anvil_core::domain::routing::DatasetType;
use anvil_core::domain::script::{ScriptSource, SynthesisSpec};
use anvil_core::domain::tier::Tier;
use anvil_core::dto::job::{PollJobResponse, QuoteRequest, SubmitJob};
use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Routing inputs shared by `quote` and `submit`
#[derive(Args, Debug, Clone)]
pub struct JobShape {
    /// Subscription tier (free, silver, gold, platinum)
    #[arg(long, default_value = "free")]
    pub tier: Tier,

    /// Dataset type (tabular, image, unknown)
    #[arg(long, default_value = "tabular", value_parser = parse_dataset_type)]
    pub dataset_type: DatasetType,

    /// Task type, e.g. classification or regression
    #[arg(long, default_value = "classification")]
    pub task: String,

    /// Dataset size in megabytes
    #[arg(long, default_value_t = 0.0)]
    pub size_mb: f64,

    /// Training epochs
    #[arg(long)]
    pub epochs: Option<u32>,

    /// Ask for a GPU
    #[arg(long)]
    pub gpu: bool,
}

impl JobShape {
    fn quote_request(&self) -> QuoteRequest {
        QuoteRequest {
            tier: self.tier,
            dataset_type: self.dataset_type,
            task_type: self.task.clone(),
            prefer_gpu: self.gpu,
            dataset_size_mb: self.size_mb,
            epochs: self.epochs,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub shape: JobShape,

    /// Project ID
    #[arg(long)]
    pub project: String,

    /// User ID
    #[arg(long)]
    pub user: String,

    /// Dataset URI (gs://...)
    #[arg(long)]
    pub dataset: String,

    /// Training program to run verbatim
    #[arg(long, conflicts_with = "synthesize", required_unless_present = "synthesize")]
    pub script: Option<PathBuf>,

    /// JSON file with { schema, algorithm, cleaning } to generate the program from
    #[arg(long)]
    pub synthesize: Option<PathBuf>,

    #[arg(long)]
    pub batch_size: Option<u32>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Number of trees for ensemble algorithms
    #[arg(long)]
    pub trees: Option<u32>,

    /// Makes retries of this submission resolve to the same job
    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// Keep polling until the job finishes
    #[arg(long)]
    pub watch: bool,
}

impl SubmitArgs {
    fn into_request(self) -> Result<SubmitJob> {
        let script = match (&self.script, &self.synthesize) {
            (Some(path), _) => ScriptSource::Source(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read script file: {}", path.display()))?,
            ),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read synthesis file: {}", path.display()))?;
                let spec: SynthesisSpec = serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid synthesis file: {}", path.display()))?;
                ScriptSource::Synthesize(spec)
            }
            (None, None) => anyhow::bail!("either --script or --synthesize is required"),
        };

        Ok(SubmitJob {
            project_id: self.project,
            user_id: self.user,
            script,
            config: HyperParameters {
                epochs: self.shape.epochs,
                batch_size: self.batch_size,
                learning_rate: self.learning_rate,
                trees: self.trees,
                prefer_gpu: self.shape.gpu,
            },
            dataset_ref: self.dataset,
            dataset_type: self.shape.dataset_type,
            dataset_size_mb: self.shape.size_mb,
            task_type: self.shape.task,
            tier: self.shape.tier,
            idempotency_key: self.idempotency_key,
        })
    }
}

fn parse_dataset_type(s: &str) -> std::result::Result<DatasetType, String> {
    serde_json::from_value(serde_json::Value::String(s.trim().to_ascii_lowercase()))
        .map_err(|_| format!("unknown dataset type: {}", s))
}

/// Show the routing decision and estimate
pub async fn quote(client: &OrchestratorClient, shape: JobShape) -> Result<()> {
    let quote = client.quote_job(&shape.quote_request()).await?;
    let decision = &quote.decision;

    println!("{}", "Quote:".bold());
    println!("  Backend:    {}", decision.backend.as_str().cyan());
    println!("  Machine:    {} ({})", decision.machine_class, decision.specs.dimmed());
    if let Some(gpu) = &decision.gpu_class {
        println!("  GPU:        {}", gpu);
    }
    println!("  Rate:       ${:.3}/h", decision.cost_per_hour);
    println!("  Estimate:   {:.1} min, ${:.2}", quote.estimate.minutes, quote.estimate.cost);
    println!("  Why:        {}", decision.justification.dimmed());

    Ok(())
}

/// Submit a job, optionally following it to completion
pub async fn submit(client: &OrchestratorClient, args: SubmitArgs) -> Result<()> {
    let watch_after = args.watch;
    let req = args.into_request()?;
    let project = req.project_id.clone();

    let resp = client.submit_job(&req).await?;

    println!("{}", "✓ Job submitted".green().bold());
    println!("  ID:         {}", resp.job_id.to_string().cyan());
    println!(
        "  Estimate:   {:.1} min, ${:.2}",
        resp.estimated_minutes, resp.estimated_cost
    );

    if watch_after {
        println!();
        watch(client, resp.job_id, &project, 10).await?;
    }

    Ok(())
}

/// Get and display a single job
pub async fn get(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    let job = client.get_job(id).await?;
    print_job_details(&job);
    Ok(())
}

/// List the jobs of a project
pub async fn list(client: &OrchestratorClient, project: &str) -> Result<()> {
    let jobs = client.list_jobs_by_project(project).await?;

    if jobs.is_empty() {
        println!("{}", format!("No jobs found for project {}.", project).yellow());
    } else {
        println!(
            "{}",
            format!("Found {} job(s) for project {}:", jobs.len(), project).bold()
        );
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Reconcile once and print the outcome
pub async fn poll(client: &OrchestratorClient, id: Uuid, project: &str) -> Result<()> {
    let resp = client.poll_job(id, project).await?;
    print_poll(&resp);
    Ok(())
}

/// Cancel a job
pub async fn cancel(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    client.cancel_job(id).await?;
    println!("{}", format!("✓ Job {} cancelled", id).green());
    Ok(())
}

/// Poll until the job reaches a terminal status
pub async fn watch(client: &OrchestratorClient, id: Uuid, project: &str, interval: u64) -> Result<()> {
    let mut last: Option<JobStatus> = None;

    loop {
        let resp = client.poll_job(id, project).await?;
        if last != Some(resp.status) {
            println!("  {} {}", "▸".cyan(), colorize_status(resp.status));
            last = Some(resp.status);
        }

        if resp.status.is_terminal() {
            println!();
            print_poll(&resp);
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}

fn print_poll(resp: &PollJobResponse) {
    println!("  Status:     {}", colorize_status(resp.status));
    if let Some(error) = &resp.error {
        println!("  Error:      {}", error.red());
    }
    if let Some(metrics) = &resp.metrics {
        print_metrics(metrics);
    }
}

/// Print a one-paragraph job summary
fn print_job_summary(job: &JobRecord) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Status:   {}", colorize_status(job.status));
    println!("    Task:     {} on {}", job.task_type, job.machine_class);
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed job information
fn print_job_details(job: &JobRecord) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Project:     {}", job.project_id.dimmed());
    println!("  Status:      {}", colorize_status(job.status));
    println!("  Tier:        {}", job.tier);
    println!("  Task:        {}", job.task_type);
    println!("  Dataset:     {}", job.dataset_ref);
    println!("  Backend:     {}", job.backend.as_str());
    match &job.gpu_class {
        Some(gpu) => println!("  Machine:     {} + {}", job.machine_class, gpu),
        None => println!("  Machine:     {}", job.machine_class),
    }
    println!(
        "  Estimate:    {:.1} min, ${:.2}",
        job.estimated_minutes, job.estimated_cost
    );
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(provisioned) = job.provisioned_at {
        println!("  Provisioned: {}", provisioned.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = job.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(seconds) = job.runtime_seconds {
        println!("  Runtime:     {}s", seconds);
    }
    if let Some(cost) = job.cost {
        println!("  Cost:        ${:.2}", cost);
    }
    if let Some(url) = &job.console_url {
        println!("  Console:     {}", url.dimmed());
    }

    if let Some(error) = &job.error {
        let kind = job.failure_kind.map(|k| k.as_str()).unwrap_or("error");
        println!("\n{}", format!("Error ({}):", kind).bold());
        println!("{}", error.red());
    }

    if !job.metrics.is_empty() {
        print_metrics(&job.metrics);
    }
}

fn print_metrics(metrics: &HashMap<String, serde_json::Value>) {
    println!("\n{}", "Metrics:".bold());
    let mut keys: Vec<_> = metrics.keys().collect();
    keys.sort();
    for key in keys {
        println!("  {} = {}", key.cyan(), metrics[key]);
    }
}

/// Colorize job status for display
fn colorize_status(status: JobStatus) -> colored::ColoredString {
    let status_str = status.as_str();
    match status {
        JobStatus::Preparing | JobStatus::Uploading | JobStatus::Submitting => status_str.yellow(),
        JobStatus::Provisioning | JobStatus::Installing | JobStatus::Downloading => {
            status_str.blue()
        }
        JobStatus::Training => status_str.cyan(),
        JobStatus::Succeeded => status_str.green(),
        JobStatus::Failed => status_str.red(),
    }
}
