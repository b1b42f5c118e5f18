//! Job Scheduler interface
//!
//! Named queues deliver [`Job`]s at least once. The sync engine and discovery
//! only see the [`JobQueue`] trait; [`DbJobQueue`] is the database-backed
//! implementation driven by [`crate::worker::QueueWorker`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::progress::InstallationKey;

pub mod db;

pub use db::DbJobQueue;

/// Logical queues with independent concurrency limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Discovery,
    InstallationSync,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Discovery => "discovery",
            QueueName::InstallationSync => "installation-sync",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discovery" => Ok(QueueName::Discovery),
            "installation-sync" => Ok(QueueName::InstallationSync),
            other => Err(QueueError::UnknownQueue(other.to_string())),
        }
    }
}

/// Kind of sync requested for an installation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Reset every task and re-fetch all history
    Full,
    /// Pick up newly discovered repositories and resume outstanding tasks
    #[default]
    Partial,
}

/// Payload carried by discovery and installation-sync jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationJobData {
    pub installation_id: i64,
    pub tenant_id: String,
    /// When the overall sync started; used for the total-duration metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_type: Option<SyncType>,
}

impl InstallationJobData {
    pub fn new<S: Into<String>>(installation_id: i64, tenant_id: S) -> Self {
        Self {
            installation_id,
            tenant_id: tenant_id.into(),
            start_time: None,
            sync_type: None,
        }
    }

    pub fn key(&self) -> InstallationKey {
        InstallationKey::new(self.installation_id, self.tenant_id.clone())
    }
}

/// Delivery options of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Delay before the job becomes deliverable
    pub delay_ms: u64,
    /// Total delivery attempts before the job is considered failed
    pub attempts: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            attempts: 1,
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    /// Fresh scheduling options that keep this job's removal policy.
    pub fn inherit(&self, delay_ms: u64, attempts: u32) -> Self {
        Self {
            delay_ms,
            attempts,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }
}

/// One delivery of a queued job
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub data: InstallationJobData,
    pub opts: JobOptions,
    /// Failed deliveries before this one
    pub attempts_made: u32,
    /// Enqueue time
    pub timestamp: DateTime<Utc>,
}

/// Queue failures
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("job payload could not be encoded or decoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
}

/// Enqueues jobs onto named queues.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        data: InstallationJobData,
        opts: JobOptions,
    ) -> Result<Uuid, QueueError>;
}

/// Error type returned by job handlers to the worker
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Processes jobs delivered from one queue.
///
/// Returning an error hands the job back to the queue's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_data_uses_camel_case() {
        let mut data = InstallationJobData::new(7, "acme");
        data.sync_type = Some(SyncType::Full);

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["installationId"], 7);
        assert_eq!(json["tenantId"], "acme");
        assert_eq!(json["syncType"], "full");
        assert!(json.get("startTime").is_none());
    }

    #[test]
    fn test_inherit_keeps_removal_policy() {
        let opts = JobOptions {
            delay_ms: 10,
            attempts: 5,
            remove_on_complete: false,
            remove_on_fail: true,
        };

        let inherited = opts.inherit(1000, 3);
        assert_eq!(inherited.delay_ms, 1000);
        assert_eq!(inherited.attempts, 3);
        assert!(!inherited.remove_on_complete);
        assert!(inherited.remove_on_fail);
    }

    #[test]
    fn test_queue_name_round_trip() {
        for queue in [QueueName::Discovery, QueueName::InstallationSync] {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
        assert!("transform".parse::<QueueName>().is_err());
    }
}
