//! # repo-sync Main Entry Point
//!
//! `serve` runs the HTTP API together with the discovery and installation-sync
//! workers; `migrate` and `enqueue` are operator one-shots.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use repo_sync::{
    config::{AppConfig, ConfigLoader},
    db,
    destination::HttpDestinationClient,
    discovery::DiscoveryHandler,
    queue::{DbJobQueue, InstallationJobData, JobOptions, JobQueue, QueueName, SyncType},
    repositories::InstallationRepository,
    server::{AppState, run_server},
    source::{GitHubClient, StaticTokenSource},
    sync_engine::InstallationSyncEngine,
    tasks::TaskCatalog,
    telemetry,
    worker::{QueueWorker, WorkerConfig},
};

#[derive(Parser, Debug)]
#[command(name = "repo-sync", version, about = "Incremental installation sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API and queue workers (default).
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Enqueue a discovery job for an installation.
    Enqueue {
        #[arg(long)]
        installation_id: i64,
        #[arg(long)]
        tenant_id: String,
        /// Reset every task instead of resuming.
        #[arg(long, default_value_t = false)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    telemetry::init_tracing(&config)?;

    if let Ok(redacted_json) = config.redacted_json() {
        info!(profile = %config.profile, config = %redacted_json, "Loaded configuration");
    }

    let db = db::init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => db::run_migrations(&db).await,
        Command::Enqueue {
            installation_id,
            tenant_id,
            full,
        } => enqueue_discovery(&config, db, installation_id, tenant_id, full).await,
        Command::Serve => {
            db::run_migrations(&db).await?;
            serve(config, db).await
        }
    }
}

async fn enqueue_discovery(
    config: &AppConfig,
    db: sea_orm::DatabaseConnection,
    installation_id: i64,
    tenant_id: String,
    full: bool,
) -> anyhow::Result<()> {
    let queue = DbJobQueue::new(db, config.queue.retry_backoff_ms);
    let data = InstallationJobData {
        sync_type: Some(if full { SyncType::Full } else { SyncType::Partial }),
        ..InstallationJobData::new(installation_id, tenant_id)
    };
    let opts = JobOptions {
        attempts: config.queue.default_attempts,
        ..JobOptions::default()
    };

    let job_id = queue.enqueue(QueueName::Discovery, data, opts).await?;
    info!(%job_id, installation_id, "Discovery job enqueued");
    Ok(())
}

async fn serve(config: AppConfig, db: sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let store = Arc::new(InstallationRepository::new(db.clone()));
    let queue = DbJobQueue::new(db.clone(), config.queue.retry_backoff_ms);

    let tokens = Arc::new(StaticTokenSource::new(
        config.github_token.clone().unwrap_or_default(),
    ));
    let github = Arc::new(GitHubClient::new(config.github_api_base.clone(), tokens));
    let destination = Arc::new(HttpDestinationClient::new(
        config.destination_api_base.clone(),
        config.destination_api_token.clone(),
    ));

    let engine = InstallationSyncEngine::new(
        store.clone(),
        Arc::new(queue.clone()),
        TaskCatalog::github(github.clone()),
        destination,
        config.engine.clone(),
    );
    let discovery = DiscoveryHandler::new(
        store,
        github,
        Arc::new(queue.clone()),
        JobOptions {
            attempts: config.queue.default_attempts,
            ..JobOptions::default()
        },
    );

    let worker_config = |concurrency| WorkerConfig {
        tick_ms: config.queue.tick_ms,
        concurrency,
        claim_batch: config.queue.claim_batch,
    };
    let workers = [
        QueueWorker::new(
            QueueName::Discovery,
            queue.clone(),
            Arc::new(discovery),
            worker_config(config.queue.discovery_concurrency),
        ),
        QueueWorker::new(
            QueueName::InstallationSync,
            queue.clone(),
            Arc::new(engine),
            worker_config(config.queue.installation_concurrency),
        ),
    ];
    let worker_handles: Vec<_> = workers
        .into_iter()
        .map(|worker| tokio::spawn(worker.run(shutdown.clone())))
        .collect();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let state = AppState::new(config, db);
    let served = run_server(state, shutdown.clone()).await;
    shutdown.cancel();

    for handle in worker_handles {
        if let Err(err) = handle.await {
            error!(error = %err, "Queue worker task panicked");
        }
    }

    served.map_err(|err| anyhow::anyhow!(err))
}
