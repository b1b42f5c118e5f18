//! Installation Sync Engine
//!
//! Processes one installation-sync job: picks the next outstanding task across
//! the installation's repositories, fetches one page of it, submits the page to
//! the destination, advances the stored cursor and decides whether to
//! reschedule, declare the installation complete or mark it failed.
//!
//! Progress is handled as a snapshot: every step loads the installation, works
//! on its own copy and writes it back with a single `save` once the task has
//! run. Before the fetch only the PENDING to ACTIVE status flip is written. The
//! state is reloaded after the fetch without comparing it to the snapshot used
//! for task selection, so two concurrent jobs for the same installation can
//! still overwrite each other's task-status write (last writer wins).

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::destination::{DestinationClient, DestinationError, SubmitOptions};
use crate::fetcher::{FetchError, fetch_with_fallback};
use crate::progress::{
    InstallationKey, InstallationProgress, NextTask, ProgressStore, RepositorySummary,
    StoreError, SyncStatus, TaskStatus,
};
use crate::queue::{Job, JobError, JobHandler, JobQueue, QueueError, QueueName};
use crate::tasks::{Edge, TaskCatalog, TaskType};

// Only the wording reqwest and the OS use for timeouts.
static TIMEOUT_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(operation|request|connection) timed out\b|(?-i)\bE(SOCKET)?TIMEDOUT\b",
    )
    .ok()
});

// GitHub's secondary rate limit wording.
static ABUSE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(secondary rate limit|abuse detection mechanism)\b").ok()
});

fn matches(pattern: &LazyLock<Option<Regex>>, message: &str) -> bool {
    pattern
        .as_ref()
        .is_some_and(|regex| regex.is_match(message))
}

/// Errors surfaced by the sync engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("submitting repository {repository_id} to the destination failed: {source}")]
    Submission {
        repository_id: i64,
        source: DestinationError,
        /// Response diagnostics of the failed submission
        diagnostics: JsonValue,
    },
    #[error("progress store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Why a failed execution is retried rather than failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    RateLimited,
    NetworkTimeout,
    AbuseDetected,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::RateLimited => "rate_limited",
            RetryReason::NetworkTimeout => "network_timeout",
            RetryReason::AbuseDetected => "abuse_detected",
        }
    }
}

/// Decision taken for an error raised while executing a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Re-enqueue the same job after `delay_ms`
    Retry { delay_ms: u64, reason: RetryReason },
    /// The repository is gone; finish the task as if it returned no edges
    CompleteTask,
    /// Mark the installation failed and propagate the error
    Fail,
}

/// Classify an execution error.
///
/// Typed signals are checked before message text: a rate-limit reset in the
/// future, then a missing repository, then a network timeout or an abuse
/// signal. Anything else fails.
pub fn classify_failure(error: &FetchError, now_ms: i64, config: &EngineConfig) -> FailureAction {
    let FetchError::Source(source) = error else {
        return FailureAction::Fail;
    };

    if let Some(reset) = source.rate_limit_reset {
        let reset_ms = reset.saturating_mul(1000);
        if reset_ms > now_ms {
            return FailureAction::Retry {
                delay_ms: (reset_ms - now_ms) as u64,
                reason: RetryReason::RateLimited,
            };
        }
    }

    if source.is_not_found() {
        return FailureAction::CompleteTask;
    }

    if matches(&TIMEOUT_PATTERN, &source.message) {
        return FailureAction::Retry {
            delay_ms: config.network_timeout_retry_delay_ms,
            reason: RetryReason::NetworkTimeout,
        };
    }

    if matches(&ABUSE_PATTERN, &source.message) {
        return FailureAction::Retry {
            delay_ms: config.abuse_retry_delay_ms,
            reason: RetryReason::AbuseDetected,
        };
    }

    FailureAction::Fail
}

/// Sync engine for installation-sync jobs
pub struct InstallationSyncEngine {
    store: Arc<dyn ProgressStore>,
    queue: Arc<dyn JobQueue>,
    catalog: TaskCatalog,
    destination: Arc<dyn DestinationClient>,
    config: EngineConfig,
}

impl InstallationSyncEngine {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        queue: Arc<dyn JobQueue>,
        catalog: TaskCatalog,
        destination: Arc<dyn DestinationClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            destination,
            config,
        }
    }

    /// Run one step of an installation's sync.
    ///
    /// Recoverable failures are rescheduled and resolve with `Ok`. Only
    /// unclassified execution errors and submission failures are returned, after
    /// the installation has been marked failed.
    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            installation_id = job.data.installation_id,
            tenant_id = %job.data.tenant_id,
        )
    )]
    pub async fn process_installation_job(&self, job: &Job) -> Result<(), EngineError> {
        let key = job.data.key();

        let Some(mut progress) = self.store.load(&key).await? else {
            info!("Installation no longer exists, dropping job");
            return Ok(());
        };

        if progress.sync_status == SyncStatus::Failed {
            warn!("Installation is marked failed, skipping until it is rediscovered");
            return Ok(());
        }

        let Some(next) = self.select_next_task(&mut progress) else {
            debug!("No outstanding tasks");
            let newly_complete = mark_complete(&mut progress);
            if self.store.save(&progress).await? && newly_complete {
                self.finish_installation(job).await;
            }
            return Ok(());
        };

        if progress.sync_status == SyncStatus::Pending
            && !self.store.set_sync_status(&key, SyncStatus::Active).await?
        {
            info!("Installation no longer exists, dropping job");
            return Ok(());
        }

        match self.execute_task(&job.data.tenant_id, &key, &next).await {
            Ok(edges) => {
                self.update_job_status(job, &edges, next.task, &next.repository)
                    .await
            }
            Err(EngineError::Fetch(err)) => self.handle_execution_failure(job, &next, err).await,
            Err(err @ EngineError::Submission { .. }) => {
                self.mark_failed(&key, &err).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Pick the next task and refresh the synced-repository count on `progress`.
    pub fn select_next_task(&self, progress: &mut InstallationProgress) -> Option<NextTask> {
        let next = progress.select_next_task();
        let labels = vec![("tenant_id", progress.key.tenant_id.clone())];
        gauge!("installation_synced_repos", &labels).set(progress.synced_repo_count as f64);
        next
    }

    /// Fetch one page of `next` and submit its payload; returns the fetched edges.
    pub async fn execute_task(
        &self,
        tenant_id: &str,
        key: &InstallationKey,
        next: &NextTask,
    ) -> Result<Vec<Edge>, EngineError> {
        let handler = self.catalog.handler(next.task);
        let started = Instant::now();

        let page = fetch_with_fallback(
            handler,
            next.task,
            key.installation_id,
            &next.repository,
            next.cursor.as_deref(),
        )
        .await?;

        histogram!("installation_task_fetch_duration_ms", "task" => next.task.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        if let Some(payload) = &page.payload {
            self.destination
                .submit_repository_update(
                    tenant_id,
                    payload,
                    SubmitOptions {
                        prevent_transitions: true,
                    },
                )
                .await
                .map_err(|source| {
                    let diagnostics = source.diagnostics();
                    error!(
                        repository_id = next.repository.id,
                        task = %next.task,
                        diagnostics = %diagnostics,
                        "Destination rejected repository update"
                    );
                    EngineError::Submission {
                        repository_id: next.repository.id,
                        source,
                        diagnostics,
                    }
                })?;
        }

        debug!(
            repository_id = next.repository.id,
            task = %next.task,
            edges = page.edges.len(),
            submitted = page.payload.is_some(),
            "Executed task"
        );

        Ok(page.edges)
    }

    /// Record the result of an execution and schedule what comes next.
    pub async fn update_job_status(
        &self,
        job: &Job,
        edges: &[Edge],
        task: TaskType,
        repository: &RepositorySummary,
    ) -> Result<(), EngineError> {
        let key = job.data.key();

        // Reload: the fetch may have taken long enough for the state to move on.
        let Some(mut progress) = self.store.load(&key).await? else {
            info!("Installation removed during execution, stopping");
            return Ok(());
        };

        match progress.repo_sync_state.get_mut(repository.id) {
            Some(repo) => {
                let task_progress = repo.task_mut(task);
                task_progress.status = if edges.is_empty() {
                    TaskStatus::Complete
                } else {
                    TaskStatus::Pending
                };
                if let Some(last) = edges.last() {
                    task_progress.cursor = Some(last.cursor.clone());
                }
            }
            None => warn!(
                repository_id = repository.id,
                "Repository missing from sync state, leaving task untouched"
            ),
        }

        let mut newly_complete = false;
        let follow_up = if !edges.is_empty() {
            Some(job.opts.inherit(
                self.config.inter_job_delay_ms,
                self.config.continuation_attempts,
            ))
        } else if self.select_next_task(&mut progress).is_some() {
            progress.sync_status = SyncStatus::Active;
            Some(job.opts.inherit(0, self.config.continuation_attempts))
        } else {
            newly_complete = mark_complete(&mut progress);
            None
        };

        if !self.store.save(&progress).await? {
            info!("Installation removed during execution, stopping");
            return Ok(());
        }

        debug!(
            repository_id = repository.id,
            task = %task,
            edges = edges.len(),
            sync_status = %progress.sync_status,
            synced_repos = progress.synced_repo_count,
            total_repos = progress.total_repo_count,
            "Updated task progress"
        );

        if let Some(opts) = follow_up {
            self.queue
                .enqueue(QueueName::InstallationSync, job.data.clone(), opts)
                .await?;
        } else if newly_complete {
            self.finish_installation(job).await;
        }

        Ok(())
    }

    async fn handle_execution_failure(
        &self,
        job: &Job,
        next: &NextTask,
        err: FetchError,
    ) -> Result<(), EngineError> {
        let now_ms = Utc::now().timestamp_millis();

        match classify_failure(&err, now_ms, &self.config) {
            FailureAction::Retry { delay_ms, reason } => {
                warn!(
                    repository_id = next.repository.id,
                    task = %next.task,
                    reason = reason.as_str(),
                    delay_ms,
                    error = %err,
                    "Task execution failed, rescheduling"
                );
                counter!("installation_sync_requeued_total", "reason" => reason.as_str())
                    .increment(1);
                self.queue
                    .enqueue(
                        QueueName::InstallationSync,
                        job.data.clone(),
                        job.opts.inherit(delay_ms, self.config.retry_attempts),
                    )
                    .await?;
                Ok(())
            }
            FailureAction::CompleteTask => {
                info!(
                    repository_id = next.repository.id,
                    task = %next.task,
                    "Repository not found upstream, completing task"
                );
                self.update_job_status(job, &[], next.task, &next.repository)
                    .await
            }
            FailureAction::Fail => {
                let err = EngineError::Fetch(err);
                self.mark_failed(&job.data.key(), &err).await?;
                Err(err)
            }
        }
    }

    async fn mark_failed(
        &self,
        key: &InstallationKey,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        error!(installation = %key, error = %err, "Installation sync failed");
        counter!("installation_sync_failed_total").increment(1);

        if let Some(mut progress) = self.store.load(key).await? {
            progress.sync_status = SyncStatus::Failed;
            self.store.save(&progress).await?;
        }
        Ok(())
    }

    /// Best-effort completion notice and total duration metric.
    async fn finish_installation(&self, job: &Job) {
        info!("Installation sync complete");

        if let Err(err) = self
            .destination
            .notify_migration_complete(&job.data.tenant_id)
            .await
        {
            warn!(
                error = %err,
                diagnostics = %err.diagnostics(),
                "Failed to notify destination of migration completion"
            );
        }

        if let Some(start_time) = job.data.start_time {
            let elapsed_ms = (Utc::now() - start_time).num_milliseconds().max(0);
            histogram!("installation_sync_duration_ms").record(elapsed_ms as f64);
        }
    }
}

/// Set the installation complete; `true` when it was not complete before.
fn mark_complete(progress: &mut InstallationProgress) -> bool {
    let newly_complete = progress.sync_status != SyncStatus::Complete;
    progress.sync_status = SyncStatus::Complete;
    newly_complete
}

#[async_trait]
impl JobHandler for InstallationSyncEngine {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.process_installation_job(job)
            .await
            .map_err(|err| Box::new(err) as JobError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceError, SourceErrorEntry};

    const NOW_MS: i64 = 1_700_000_000_000;

    fn classify(error: SourceError) -> FailureAction {
        classify_failure(
            &FetchError::Source(error),
            NOW_MS,
            &EngineConfig::default(),
        )
    }

    #[test]
    fn test_future_rate_limit_reset_delays_until_reset() {
        let reset_seconds = NOW_MS / 1000 + 90;
        let action = classify(
            SourceError::http(403, "API rate limit exceeded").with_rate_limit_reset(reset_seconds),
        );

        assert_eq!(
            action,
            FailureAction::Retry {
                delay_ms: (reset_seconds * 1000 - NOW_MS) as u64,
                reason: RetryReason::RateLimited,
            }
        );
    }

    #[test]
    fn test_past_rate_limit_reset_falls_through() {
        let reset_seconds = NOW_MS / 1000;
        let action =
            classify(SourceError::http(403, "forbidden").with_rate_limit_reset(reset_seconds));

        assert_eq!(action, FailureAction::Fail);
    }

    #[test]
    fn test_network_timeout_retries_with_fixed_delay() {
        let action = classify(SourceError::new("GitHub request timed out: operation timed out"));

        assert_eq!(
            action,
            FailureAction::Retry {
                delay_ms: 5_000,
                reason: RetryReason::NetworkTimeout,
            }
        );
    }

    #[test]
    fn test_abuse_signal_retries_with_long_delay() {
        let action = classify(SourceError::http(
            403,
            "You have exceeded a secondary rate limit. Please wait a few minutes.",
        ));

        assert_eq!(
            action,
            FailureAction::Retry {
                delay_ms: 60_000,
                reason: RetryReason::AbuseDetected,
            }
        );
    }

    #[test]
    fn test_not_found_completes_task() {
        assert_eq!(
            classify(SourceError::http(404, "Not Found")),
            FailureAction::CompleteTask
        );
        assert_eq!(
            classify(SourceError::new("gone").with_errors(vec![SourceErrorEntry {
                error_type: Some("NOT_FOUND".to_string()),
                message: None,
            }])),
            FailureAction::CompleteTask
        );
    }

    #[test]
    fn test_not_found_wins_over_message_text() {
        for name in ["timeout-handler", "abuse-reports", "etimedout"] {
            let error = SourceError::not_found(format!(
                "Could not resolve to a Repository with the name 'acme/{}'.",
                name
            ));
            assert_eq!(classify(error), FailureAction::CompleteTask, "{}", name);
        }
    }

    #[test]
    fn test_loose_wording_is_not_a_retry_signal() {
        assert_eq!(
            classify(SourceError::http(422, "field 'timeout' is invalid")),
            FailureAction::Fail
        );
        assert_eq!(
            classify(SourceError::http(403, "Resource protected by abuse-reports policy")),
            FailureAction::Fail
        );
    }

    #[test]
    fn test_abuse_detection_mechanism_phrase_retries() {
        let action = classify(SourceError::http(
            403,
            "You have triggered an abuse detection mechanism. Please wait a few minutes.",
        ));

        assert_eq!(
            action,
            FailureAction::Retry {
                delay_ms: 60_000,
                reason: RetryReason::AbuseDetected,
            }
        );
    }

    #[test]
    fn test_unclassified_error_fails() {
        assert_eq!(
            classify(SourceError::http(500, "Internal Server Error")),
            FailureAction::Fail
        );
    }

    #[test]
    fn test_exhausted_fallback_fails() {
        let error = FetchError::FallbackExhausted {
            task: TaskType::Commit,
            repository_id: 1,
            last: SourceError::new("request timed out"),
        };

        assert_eq!(
            classify_failure(&error, NOW_MS, &EngineConfig::default()),
            FailureAction::Fail
        );
    }
}
