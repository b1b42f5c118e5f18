//! Per-repository sync progress.
//!
//! `RepoSyncState` is the JSON document persisted in `installations.repo_sync_state`.
//! It maps repository ids to a [`RepoProgress`] record holding one status/cursor
//! pair per [`TaskType`]. Entries are only ever added or refreshed, never removed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::tasks::TaskType;

/// Overall sync status of an installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Active => "ACTIVE",
            SyncStatus::Complete => "COMPLETE",
            SyncStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(SyncStatus::Pending),
            "ACTIVE" => Ok(SyncStatus::Active),
            "COMPLETE" => Ok(SyncStatus::Complete),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status '{}'", other)),
        }
    }
}

/// Status of one task type for one repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Complete,
}

/// Status and resume position of one task type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskProgress {
    pub status: TaskStatus,
    /// Continuation token of the last fetched edge; `None` until the first page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl TaskProgress {
    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Complete
    }
}

/// Summary metadata of a source repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySummary {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub full_name: String,
    /// Last activity on the source host; only used for ordering
    pub updated_at: DateTime<Utc>,
}

/// Progress of every task type for one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoProgress {
    pub repository: RepositorySummary,
    #[serde(default)]
    pub tasks: BTreeMap<TaskType, TaskProgress>,
}

impl RepoProgress {
    /// New repository with every task pending and no cursor.
    pub fn new(repository: RepositorySummary) -> Self {
        Self {
            repository,
            tasks: TaskType::ALL
                .iter()
                .map(|task| (*task, TaskProgress::default()))
                .collect(),
        }
    }

    /// Progress of `task`; a task missing from storage reads as pending.
    pub fn task(&self, task: TaskType) -> TaskProgress {
        self.tasks.get(&task).cloned().unwrap_or_default()
    }

    pub fn task_mut(&mut self, task: TaskType) -> &mut TaskProgress {
        self.tasks.entry(task).or_default()
    }

    /// First task in catalog order that is not complete.
    pub fn next_pending_task(&self) -> Option<TaskType> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|task| !self.task(*task).is_complete())
    }

    pub fn is_synced(&self) -> bool {
        self.next_pending_task().is_none()
    }

    /// Reset every task to pending without a cursor (full resync).
    pub fn reset(&mut self) {
        for task in TaskType::ALL {
            *self.task_mut(task) = TaskProgress::default();
        }
    }
}

/// The next unit of work chosen for an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTask {
    pub task: TaskType,
    pub repository: RepositorySummary,
    pub cursor: Option<String>,
}

/// Mapping from repository id to its progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoSyncState {
    repos: BTreeMap<i64, RepoProgress>,
}

impl RepoSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn get(&self, repository_id: i64) -> Option<&RepoProgress> {
        self.repos.get(&repository_id)
    }

    pub fn get_mut(&mut self, repository_id: i64) -> Option<&mut RepoProgress> {
        self.repos.get_mut(&repository_id)
    }

    pub fn repositories(&self) -> impl Iterator<Item = &RepoProgress> {
        self.repos.values()
    }

    /// Add a newly discovered repository or refresh the summary of a known one.
    ///
    /// Returns `true` when the repository was not tracked before. Task progress
    /// of known repositories is left untouched.
    pub fn upsert_repository(&mut self, repository: RepositorySummary) -> bool {
        match self.repos.get_mut(&repository.id) {
            Some(existing) => {
                existing.repository = repository;
                false
            }
            None => {
                self.repos
                    .insert(repository.id, RepoProgress::new(repository));
                true
            }
        }
    }

    /// Reset every task of every repository (full resync).
    pub fn reset_all(&mut self) {
        for progress in self.repos.values_mut() {
            progress.reset();
        }
    }

    /// Number of repositories whose every task type is complete.
    pub fn synced_repo_count(&self) -> usize {
        self.repos.values().filter(|repo| repo.is_synced()).count()
    }

    /// Repositories most recently updated first, ties broken by ascending id.
    pub fn ordered(&self) -> Vec<&RepoProgress> {
        let mut ordered: Vec<&RepoProgress> = self.repos.values().collect();
        ordered.sort_by(|a, b| {
            b.repository
                .updated_at
                .cmp(&a.repository.updated_at)
                .then_with(|| a.repository.id.cmp(&b.repository.id))
        });
        ordered
    }

    /// First outstanding task of the first repository (in [`Self::ordered`] order)
    /// that still has work, or `None` once everything is complete.
    pub fn next_task(&self) -> Option<NextTask> {
        self.ordered().into_iter().find_map(|progress| {
            progress.next_pending_task().map(|task| NextTask {
                task,
                repository: progress.repository.clone(),
                cursor: progress.task(task).cursor,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo(id: i64, updated_hour: u32) -> RepositorySummary {
        RepositorySummary {
            id,
            name: format!("repo-{}", id),
            owner: "acme".to_string(),
            full_name: format!("acme/repo-{}", id),
            updated_at: Utc
                .with_ymd_and_hms(2025, 6, 1, updated_hour, 0, 0)
                .unwrap(),
        }
    }

    fn complete(state: &mut RepoSyncState, id: i64, task: TaskType) {
        state.get_mut(id).unwrap().task_mut(task).status = TaskStatus::Complete;
    }

    #[test]
    fn test_next_task_prefers_most_recently_updated_repository() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(1, 8));
        state.upsert_repository(repo(2, 12));
        state.upsert_repository(repo(3, 10));

        let next = state.next_task().unwrap();
        assert_eq!(next.repository.id, 2);
        assert_eq!(next.task, TaskType::Pull);
        assert_eq!(next.cursor, None);
    }

    #[test]
    fn test_next_task_breaks_ties_by_repository_id() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(9, 10));
        state.upsert_repository(repo(4, 10));

        assert_eq!(state.next_task().unwrap().repository.id, 4);
    }

    #[test]
    fn test_next_task_follows_catalog_order_and_returns_cursor() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(1, 10));
        complete(&mut state, 1, TaskType::Pull);
        state
            .get_mut(1)
            .unwrap()
            .task_mut(TaskType::Commit)
            .cursor = Some("commit-cursor".to_string());
        state.get_mut(1).unwrap().task_mut(TaskType::Branch).cursor =
            Some("branch-cursor".to_string());

        let next = state.next_task().unwrap();
        assert_eq!(next.task, TaskType::Branch);
        assert_eq!(next.cursor.as_deref(), Some("branch-cursor"));
    }

    #[test]
    fn test_next_task_skips_synced_repositories() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(1, 12));
        state.upsert_repository(repo(2, 8));
        for task in TaskType::ALL {
            complete(&mut state, 1, task);
        }

        let next = state.next_task().unwrap();
        assert_eq!(next.repository.id, 2);
        assert_eq!(state.synced_repo_count(), 1);
    }

    #[test]
    fn test_next_task_is_none_when_everything_complete() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(1, 12));
        for task in TaskType::ALL {
            complete(&mut state, 1, task);
        }

        assert!(state.next_task().is_none());
        assert_eq!(state.synced_repo_count(), 1);
    }

    #[test]
    fn test_next_task_is_deterministic_across_calls() {
        let mut state = RepoSyncState::new();
        state.upsert_repository(repo(5, 9));
        state.upsert_repository(repo(6, 9));
        complete(&mut state, 5, TaskType::Pull);

        let first = state.next_task();
        for _ in 0..5 {
            assert_eq!(state.next_task(), first);
        }
    }

    #[test]
    fn test_upsert_keeps_progress_of_known_repository() {
        let mut state = RepoSyncState::new();
        assert!(state.upsert_repository(repo(1, 8)));
        complete(&mut state, 1, TaskType::Pull);

        assert!(!state.upsert_repository(repo(1, 14)));
        let progress = state.get(1).unwrap();
        assert!(progress.task(TaskType::Pull).is_complete());
        assert_eq!(progress.repository.updated_at, repo(1, 14).updated_at);
    }

    #[test]
    fn test_missing_task_entry_reads_as_pending() {
        let json = serde_json::json!({
            "7": {
                "repository": {
                    "id": 7,
                    "name": "repo-7",
                    "owner": "acme",
                    "fullName": "acme/repo-7",
                    "updatedAt": "2025-06-01T10:00:00Z"
                },
                "tasks": { "pull": { "status": "COMPLETE" } }
            }
        });
        let state: RepoSyncState = serde_json::from_value(json).unwrap();

        let next = state.next_task().unwrap();
        assert_eq!(next.task, TaskType::Branch);
        assert_eq!(next.repository.id, 7);
    }
}
