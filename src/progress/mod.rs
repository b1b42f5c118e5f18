//! Progress Store
//!
//! Durable per-installation sync state. The sync engine reads an
//! [`InstallationProgress`] snapshot at the start of each step, mutates its own
//! copy, and writes it back with a single explicit `save`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod state;

pub use state::{
    NextTask, RepoProgress, RepoSyncState, RepositorySummary, SyncStatus, TaskProgress,
    TaskStatus,
};

/// Identifier pair of an installation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstallationKey {
    /// Installation id on the source host
    pub installation_id: i64,
    /// Destination tenant id
    pub tenant_id: String,
}

impl InstallationKey {
    pub fn new<S: Into<String>>(installation_id: i64, tenant_id: S) -> Self {
        Self {
            installation_id,
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for InstallationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.installation_id, self.tenant_id)
    }
}

/// Snapshot of one installation's sync progress
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationProgress {
    pub key: InstallationKey,
    pub sync_status: SyncStatus,
    pub repo_sync_state: RepoSyncState,
    pub synced_repo_count: u32,
    pub total_repo_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl InstallationProgress {
    /// Fresh, pending installation without repositories.
    pub fn new(key: InstallationKey) -> Self {
        Self {
            key,
            sync_status: SyncStatus::Pending,
            repo_sync_state: RepoSyncState::new(),
            synced_repo_count: 0,
            total_repo_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Select the next outstanding task and refresh the synced-repository count.
    pub fn select_next_task(&mut self) -> Option<NextTask> {
        self.synced_repo_count = self.repo_sync_state.synced_repo_count() as u32;
        self.total_repo_count = self.repo_sync_state.len() as u32;
        self.repo_sync_state.next_task()
    }
}

/// Errors raised by a progress store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("stored sync state for installation {key} is unreadable: {source}")]
    CorruptState {
        key: String,
        source: serde_json::Error,
    },
    #[error("stored sync status for installation {key} is invalid: {value}")]
    InvalidStatus { key: String, value: String },
}

/// Durable storage of installation progress.
///
/// Every operation treats a missing installation as a valid empty result rather
/// than an error: `load` yields `None`, the writes yield `false`.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, key: &InstallationKey) -> Result<Option<InstallationProgress>, StoreError>;

    async fn save(&self, progress: &InstallationProgress) -> Result<bool, StoreError>;

    /// Write only the overall status, leaving repository progress untouched.
    async fn set_sync_status(
        &self,
        key: &InstallationKey,
        status: SyncStatus,
    ) -> Result<bool, StoreError>;
}
