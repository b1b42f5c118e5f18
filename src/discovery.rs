//! Repository discovery
//!
//! Handles discovery jobs: lists the repositories an installation can see,
//! merges them into its sync state and starts a new installation sync. This is
//! also how a FAILED installation is brought back into the sync cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::progress::{ProgressStore, StoreError, SyncStatus};
use crate::queue::{
    InstallationJobData, Job, JobError, JobHandler, JobOptions, JobQueue, QueueError, QueueName,
    SyncType,
};
use crate::source::{RepositoryLister, SourceError};

/// Errors raised while discovering repositories
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("listing repositories failed: {0}")]
    Source(#[from] SourceError),
    #[error("progress store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Summary of one discovery run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub discovered: usize,
    pub added: usize,
    pub total: usize,
}

/// Handler for the discovery queue
pub struct DiscoveryHandler {
    store: Arc<dyn ProgressStore>,
    lister: Arc<dyn RepositoryLister>,
    queue: Arc<dyn JobQueue>,
    sync_job_options: JobOptions,
}

impl DiscoveryHandler {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        lister: Arc<dyn RepositoryLister>,
        queue: Arc<dyn JobQueue>,
        sync_job_options: JobOptions,
    ) -> Self {
        Self {
            store,
            lister,
            queue,
            sync_job_options,
        }
    }

    /// Merge the installation's current repositories into its sync state and
    /// enqueue an installation sync. Returns `None` when the installation is gone.
    #[instrument(
        skip(self, data),
        fields(installation_id = data.installation_id, tenant_id = %data.tenant_id)
    )]
    pub async fn discover(
        &self,
        data: &InstallationJobData,
    ) -> Result<Option<DiscoveryOutcome>, DiscoveryError> {
        let key = data.key();
        let Some(mut progress) = self.store.load(&key).await? else {
            info!("Installation no longer exists, skipping discovery");
            return Ok(None);
        };

        let repositories = self.lister.list_repositories(key.installation_id).await?;
        let discovered = repositories.len();
        let added = repositories
            .into_iter()
            .filter(|repository| progress.repo_sync_state.upsert_repository(repository.clone()))
            .count();

        let sync_type = data.sync_type.unwrap_or_default();
        if sync_type == SyncType::Full {
            progress.repo_sync_state.reset_all();
        }

        progress.total_repo_count = progress.repo_sync_state.len() as u32;
        progress.synced_repo_count = progress.repo_sync_state.synced_repo_count() as u32;
        // A finished installation stays finished unless there is new work, so the
        // completion notice is not sent again.
        let unchanged_complete = progress.sync_status == SyncStatus::Complete
            && sync_type == SyncType::Partial
            && added == 0;
        if !unchanged_complete {
            progress.sync_status = SyncStatus::Pending;
        }

        if !self.store.save(&progress).await? {
            info!("Installation removed during discovery");
            return Ok(None);
        }

        let sync_data = InstallationJobData {
            start_time: Some(Utc::now()),
            sync_type: Some(sync_type),
            ..InstallationJobData::new(key.installation_id, key.tenant_id.clone())
        };
        self.queue
            .enqueue(QueueName::InstallationSync, sync_data, self.sync_job_options)
            .await?;

        let outcome = DiscoveryOutcome {
            discovered,
            added,
            total: progress.repo_sync_state.len(),
        };
        info!(
            discovered = outcome.discovered,
            added = outcome.added,
            total = outcome.total,
            full = sync_type == SyncType::Full,
            "Discovery complete, installation sync enqueued"
        );

        Ok(Some(outcome))
    }
}

#[async_trait]
impl JobHandler for DiscoveryHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.discover(&job.data)
            .await
            .map(|_| ())
            .map_err(|err| Box::new(err) as JobError)
    }
}
