//! Task Catalog
//!
//! The closed set of task types synchronized per repository, in the order the
//! engine works through them, and the handler table that fetches one page of a
//! task type.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::destination::RepositoryUpdate;
use crate::progress::RepositorySummary;
use crate::source::{GitHubClient, SourceError};

pub mod github;

/// A category of source data synchronized independently per repository
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Pull,
    Branch,
    Commit,
}

impl TaskType {
    /// Every task type in catalog declaration order
    pub const ALL: [TaskType; 3] = [TaskType::Pull, TaskType::Branch, TaskType::Commit];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Pull => "pull",
            TaskType::Branch => "branch",
            TaskType::Commit => "commit",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|task| task.as_str() == value)
            .ok_or_else(|| format!("unknown task type '{}'", value))
    }
}

/// One fetched item's continuation token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub cursor: String,
}

impl Edge {
    pub fn new<S: Into<String>>(cursor: S) -> Self {
        Self {
            cursor: cursor.into(),
        }
    }
}

/// Result of fetching one page of a task type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    /// Fetched items in forward order; empty once the task is exhausted
    pub edges: Vec<Edge>,
    /// Destination update for this page, absent when nothing changed
    pub payload: Option<RepositoryUpdate>,
}

impl PageResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Continuation token to resume after this page
    pub fn last_cursor(&self) -> Option<&str> {
        self.edges.last().map(|edge| edge.cursor.as_str())
    }
}

/// Fetches pages of one task type.
///
/// Resuming from the last edge's cursor must neither re-return a seen item nor
/// skip an unseen one. `page_size` is an upper bound, not an exact count.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn fetch_page(
        &self,
        installation_id: i64,
        repository: &RepositorySummary,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<PageResult, SourceError>;
}

/// Handler lookup table with one entry per [`TaskType`]
#[derive(Clone)]
pub struct TaskCatalog {
    pull: Arc<dyn TaskHandler>,
    branch: Arc<dyn TaskHandler>,
    commit: Arc<dyn TaskHandler>,
}

impl TaskCatalog {
    pub fn new(
        pull: Arc<dyn TaskHandler>,
        branch: Arc<dyn TaskHandler>,
        commit: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            pull,
            branch,
            commit,
        }
    }

    /// Catalog backed by the GitHub GraphQL handlers
    pub fn github(client: Arc<GitHubClient>) -> Self {
        Self::new(
            Arc::new(github::PullRequestTask::new(client.clone())),
            Arc::new(github::BranchTask::new(client.clone())),
            Arc::new(github::CommitTask::new(client)),
        )
    }

    pub fn handler(&self, task: TaskType) -> &dyn TaskHandler {
        match task {
            TaskType::Pull => self.pull.as_ref(),
            TaskType::Branch => self.branch.as_ref(),
            TaskType::Commit => self.commit.as_ref(),
        }
    }
}
