use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anvil_orchestrator::api::{self, AppState};
use anvil_orchestrator::config::Config;
use anvil_orchestrator::credentials::Credentials;
use anvil_orchestrator::db;
use anvil_orchestrator::events::{self, EventBus};
use anvil_orchestrator::provider::ComputeEngine;
use anvil_orchestrator::repository::{PgJobStore, PgQuotaStore};
use anvil_orchestrator::scheduler::PollSettings;
use anvil_orchestrator::service::{Deps, JobService, Settings};
use anvil_orchestrator::storage::GcsObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anvil_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Anvil Orchestrator...");

    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let http = reqwest::Client::new();
    let credentials = Credentials::from_config(config.access_token.clone(), http.clone());

    let deps = Deps {
        jobs: Arc::new(PgJobStore::new(pool.clone())),
        quotas: Arc::new(PgQuotaStore::new(pool)),
        objects: Arc::new(GcsObjectStore::new(
            http.clone(),
            credentials.clone(),
            config.artifact_bucket.clone(),
        )),
        provider: Arc::new(ComputeEngine::new(
            http,
            credentials,
            config.gcp_project.clone(),
            config.gcp_zone.clone(),
        )),
        events: EventBus::new(),
    };
    let _event_logger = events::spawn_event_logger(&deps.events);

    let service = Arc::new(JobService::new(
        deps,
        Settings::from(&config),
        PollSettings::from(&config),
    ));

    // Jobs submitted before a restart keep being reconciled
    service
        .scheduler()
        .resume()
        .await
        .context("Failed to resume polling of active jobs")?;

    let app = api::create_router(AppState { jobs: service });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
