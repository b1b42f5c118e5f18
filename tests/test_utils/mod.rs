//! Test utilities for repo-sync integration tests.
//!
//! In-memory SQLite setup plus recording doubles for the progress store, job
//! queue, destination and task handlers used by the sync engine.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use repo_sync::destination::{
    BranchEntry, DestinationClient, DestinationError, RepositoryUpdate, SubmitOptions,
};
use repo_sync::progress::{
    InstallationKey, InstallationProgress, ProgressStore, RepositorySummary, StoreError,
    SyncStatus,
};
use repo_sync::queue::{InstallationJobData, Job, JobOptions, JobQueue, QueueError, QueueName};
use repo_sync::source::{RepositoryLister, SourceError};
use repo_sync::tasks::{Edge, PageResult, TaskCatalog, TaskHandler};
use sea_orm::{Database, DatabaseConnection};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Repository summary whose `updated_at` is 2025-06-01 at `updated_hour`.
pub fn repository(id: i64, name: &str, updated_hour: u32) -> RepositorySummary {
    RepositorySummary {
        id,
        name: name.to_string(),
        owner: "acme".to_string(),
        full_name: format!("acme/{}", name),
        updated_at: at_hour(updated_hour),
    }
}

pub fn at_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
}

/// Installation-sync job delivery for `key` with default options.
pub fn sync_job(key: &InstallationKey) -> Job {
    Job {
        id: Uuid::new_v4(),
        queue: QueueName::InstallationSync,
        data: InstallationJobData {
            start_time: Some(Utc::now()),
            ..InstallationJobData::new(key.installation_id, key.tenant_id.clone())
        },
        opts: JobOptions::default(),
        attempts_made: 0,
        timestamp: Utc::now(),
    }
}

/// Installation-sync job rebuilt from a recorded enqueue.
pub fn job_from(enqueued: &EnqueuedJob) -> Job {
    Job {
        id: Uuid::new_v4(),
        queue: enqueued.queue,
        data: enqueued.data.clone(),
        opts: enqueued.opts,
        attempts_made: 0,
        timestamp: Utc::now(),
    }
}

/// Page with one edge per cursor and a branch payload for `repository`.
pub fn page(repository: &RepositorySummary, cursors: &[&str]) -> PageResult {
    PageResult {
        edges: cursors.iter().map(|cursor| Edge::new(*cursor)).collect(),
        payload: Some(RepositoryUpdate {
            id: repository.id,
            name: repository.name.clone(),
            full_name: repository.full_name.clone(),
            url: format!("https://github.com/{}", repository.full_name),
            updated_at: repository.updated_at,
            pull_requests: Vec::new(),
            branches: cursors
                .iter()
                .map(|cursor| BranchEntry {
                    name: cursor.to_string(),
                    last_commit: None,
                })
                .collect(),
            commits: Vec::new(),
        }),
    }
}

type LoadHook = Box<dyn FnOnce(&mut InstallationProgress) + Send>;

/// Progress store kept in memory
#[derive(Default)]
pub struct MemoryProgressStore {
    installations: Mutex<HashMap<InstallationKey, InstallationProgress>>,
    saves: Mutex<Vec<InstallationProgress>>,
    status_writes: Mutex<Vec<SyncStatus>>,
    after_next_load: Mutex<Option<LoadHook>>,
}

impl MemoryProgressStore {
    pub fn insert(&self, progress: InstallationProgress) {
        self.installations
            .lock()
            .unwrap()
            .insert(progress.key.clone(), progress);
    }

    pub fn get(&self, key: &InstallationKey) -> Option<InstallationProgress> {
        self.installations.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &InstallationKey) {
        self.installations.lock().unwrap().remove(key);
    }

    /// Every snapshot successfully saved, in order.
    pub fn saves(&self) -> Vec<InstallationProgress> {
        self.saves.lock().unwrap().clone()
    }

    /// Every status-only write, in order.
    pub fn status_writes(&self) -> Vec<SyncStatus> {
        self.status_writes.lock().unwrap().clone()
    }

    /// Change the stored installation right after the next `load` hands out
    /// its snapshot, as a concurrent job would.
    pub fn after_next_load<F>(&self, change: F)
    where
        F: FnOnce(&mut InstallationProgress) + Send + 'static,
    {
        *self.after_next_load.lock().unwrap() = Some(Box::new(change));
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, key: &InstallationKey) -> Result<Option<InstallationProgress>, StoreError> {
        let snapshot = self.get(key);
        if let Some(change) = self.after_next_load.lock().unwrap().take() {
            if let Some(stored) = self.installations.lock().unwrap().get_mut(key) {
                change(stored);
            }
        }
        Ok(snapshot)
    }

    async fn save(&self, progress: &InstallationProgress) -> Result<bool, StoreError> {
        let mut installations = self.installations.lock().unwrap();
        match installations.get_mut(&progress.key) {
            Some(stored) => {
                *stored = InstallationProgress {
                    updated_at: Utc::now(),
                    ..progress.clone()
                };
                self.saves.lock().unwrap().push(stored.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_sync_status(
        &self,
        key: &InstallationKey,
        status: SyncStatus,
    ) -> Result<bool, StoreError> {
        let mut installations = self.installations.lock().unwrap();
        match installations.get_mut(key) {
            Some(stored) => {
                stored.sync_status = status;
                stored.updated_at = Utc::now();
                self.status_writes.lock().unwrap().push(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// One recorded enqueue
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub queue: QueueName,
    pub data: InstallationJobData,
    pub opts: JobOptions,
}

/// Job queue that only records what was enqueued
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<EnqueuedJob>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<EnqueuedJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<EnqueuedJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        data: InstallationJobData,
        opts: JobOptions,
    ) -> Result<Uuid, QueueError> {
        self.jobs
            .lock()
            .unwrap()
            .push(EnqueuedJob { queue, data, opts });
        Ok(Uuid::new_v4())
    }
}

/// One recorded destination submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub tenant_id: String,
    pub payload: RepositoryUpdate,
    pub options: SubmitOptions,
}

/// Destination double recording submissions and completion notices
#[derive(Default)]
pub struct FakeDestination {
    submissions: Mutex<Vec<Submission>>,
    notifications: Mutex<Vec<String>>,
    reject_status: Mutex<Option<u16>>,
}

impl FakeDestination {
    /// Reject every following submission with `status`.
    pub fn reject_with(&self, status: u16) {
        *self.reject_status.lock().unwrap() = Some(status);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationClient for FakeDestination {
    async fn submit_repository_update(
        &self,
        tenant_id: &str,
        payload: &RepositoryUpdate,
        options: SubmitOptions,
    ) -> Result<(), DestinationError> {
        if let Some(status) = *self.reject_status.lock().unwrap() {
            return Err(DestinationError::Http {
                status,
                body: Some("rejected".to_string()),
            });
        }
        self.submissions.lock().unwrap().push(Submission {
            tenant_id: tenant_id.to_string(),
            payload: payload.clone(),
            options,
        });
        Ok(())
    }

    async fn notify_migration_complete(&self, tenant_id: &str) -> Result<(), DestinationError> {
        self.notifications
            .lock()
            .unwrap()
            .push(tenant_id.to_string());
        Ok(())
    }
}

/// One recorded page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub repository_id: i64,
    pub cursor: Option<String>,
    pub page_size: u32,
}

/// Task handler replaying scripted responses; an exhausted script yields empty pages.
#[derive(Default)]
pub struct ScriptedTaskHandler {
    responses: Mutex<VecDeque<Result<PageResult, SourceError>>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedTaskHandler {
    pub fn push(&self, response: Result<PageResult, SourceError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for ScriptedTaskHandler {
    async fn fetch_page(
        &self,
        _installation_id: i64,
        repository: &RepositorySummary,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<PageResult, SourceError> {
        self.requests.lock().unwrap().push(PageRequest {
            repository_id: repository.id,
            cursor: cursor.map(str::to_string),
            page_size,
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PageResult::empty()))
    }
}

/// Scripted handlers for each task type
pub struct ScriptedCatalog {
    pub pull: Arc<ScriptedTaskHandler>,
    pub branch: Arc<ScriptedTaskHandler>,
    pub commit: Arc<ScriptedTaskHandler>,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self {
            pull: Arc::new(ScriptedTaskHandler::default()),
            branch: Arc::new(ScriptedTaskHandler::default()),
            commit: Arc::new(ScriptedTaskHandler::default()),
        }
    }

    pub fn catalog(&self) -> TaskCatalog {
        TaskCatalog::new(self.pull.clone(), self.branch.clone(), self.commit.clone())
    }
}

/// Repository lister returning a fixed list
pub struct StaticLister {
    pub repositories: Vec<RepositorySummary>,
}

#[async_trait]
impl RepositoryLister for StaticLister {
    async fn list_repositories(
        &self,
        _installation_id: i64,
    ) -> Result<Vec<RepositorySummary>, SourceError> {
        Ok(self.repositories.clone())
    }
}
