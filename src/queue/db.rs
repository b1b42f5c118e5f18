//! Database-backed job queue
//!
//! Jobs live in `queue_jobs`. Due jobs are claimed atomically (select ids,
//! flip them to `active` in one UPDATE, re-read what was actually claimed) so
//! several workers may poll the same queue without double delivery.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::{Rng, thread_rng};
use sea_orm::prelude::*;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::queue_job::{
    self, ActiveModel as QueueJobActiveModel, Entity as QueueJobEntity,
};
use crate::queue::{InstallationJobData, Job, JobOptions, JobQueue, QueueError, QueueName};

/// Longest delay accepted at enqueue time (24 days)
const MAX_DELAY_MS: u64 = i32::MAX as u64;

/// Upper bound of the retry backoff between failed deliveries
const MAX_RETRY_BACKOFF_MS: u64 = 15 * 60 * 1000;

/// Jitter added on top of the retry backoff, as a fraction of it
const RETRY_JITTER_FACTOR: f64 = 0.1;

const STATUS_WAITING: &str = "waiting";
const STATUS_ACTIVE: &str = "active";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

/// What happened to a job after a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled
    Retrying { run_at: DateTime<Utc> },
    /// The attempts budget is spent
    Exhausted,
}

/// Job queue persisted in the `queue_jobs` table
#[derive(Clone)]
pub struct DbJobQueue {
    db: DatabaseConnection,
    retry_backoff_ms: u64,
}

impl DbJobQueue {
    pub fn new(db: DatabaseConnection, retry_backoff_ms: u64) -> Self {
        Self {
            db,
            retry_backoff_ms,
        }
    }

    /// Claim up to `limit` due jobs of `queue` and mark them active.
    pub async fn claim_due(&self, queue: QueueName, limit: u64) -> Result<Vec<Job>, QueueError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let due_ids = QueueJobEntity::find()
            .select_only()
            .column(queue_job::Column::Id)
            .filter(queue_job::Column::Queue.eq(queue.as_str()))
            .filter(queue_job::Column::Status.eq(STATUS_WAITING))
            .filter(queue_job::Column::RunAt.lte(now))
            .order_by_asc(queue_job::Column::RunAt)
            .order_by_asc(queue_job::Column::CreatedAt)
            .limit(Some(limit))
            .into_tuple::<Uuid>()
            .all(&txn)
            .await?;

        if due_ids.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let update_result = QueueJobEntity::update_many()
            .col_expr(queue_job::Column::Status, Expr::value(STATUS_ACTIVE))
            .col_expr(queue_job::Column::StartedAt, Expr::value(now))
            .col_expr(queue_job::Column::UpdatedAt, Expr::value(now))
            .filter(queue_job::Column::Id.is_in(due_ids.clone()))
            .filter(queue_job::Column::Status.eq(STATUS_WAITING))
            .exec(&txn)
            .await?;

        let claimed = if update_result.rows_affected > 0 {
            QueueJobEntity::find()
                .filter(queue_job::Column::Id.is_in(due_ids))
                .filter(queue_job::Column::Status.eq(STATUS_ACTIVE))
                .filter(queue_job::Column::StartedAt.eq(now))
                .order_by_asc(queue_job::Column::RunAt)
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        let mut jobs = Vec::with_capacity(claimed.len());
        for model in claimed {
            let job_id = model.id;
            match to_job(model) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    error!(job_id = %job_id, queue = %queue, error = %err, "Discarding undecodable job");
                    self.mark_failed(job_id, json!({ "message": err.to_string() }))
                        .await?;
                }
            }
        }

        debug!(queue = %queue, claimed = jobs.len(), "Claimed due jobs");
        Ok(jobs)
    }

    /// Acknowledge a successful delivery.
    pub async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        if job.opts.remove_on_complete {
            QueueJobEntity::delete_by_id(job.id).exec(&self.db).await?;
        } else {
            let now = Utc::now();
            QueueJobEntity::update_many()
                .col_expr(queue_job::Column::Status, Expr::value(STATUS_COMPLETED))
                .col_expr(queue_job::Column::FinishedAt, Expr::value(now))
                .col_expr(queue_job::Column::UpdatedAt, Expr::value(now))
                .filter(queue_job::Column::Id.eq(job.id))
                .exec(&self.db)
                .await?;
        }

        counter!("queue_jobs_completed_total", "queue" => job.queue.as_str()).increment(1);
        Ok(())
    }

    /// Record a failed delivery and schedule a retry while attempts remain.
    pub async fn fail(&self, job: &Job, error_message: &str) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let attempts_made = job.attempts_made.saturating_add(1);
        let error_details = json!({
            "message": error_message,
            "attemptsMade": attempts_made,
            "timestamp": now.to_rfc3339(),
        });

        if attempts_made < job.opts.attempts {
            let backoff_ms = retry_backoff(self.retry_backoff_ms, attempts_made);
            let run_at = now + Duration::milliseconds(backoff_ms as i64);

            QueueJobEntity::update_many()
                .col_expr(queue_job::Column::Status, Expr::value(STATUS_WAITING))
                .col_expr(queue_job::Column::AttemptsMade, Expr::value(attempts_made as i32))
                .col_expr(queue_job::Column::RunAt, Expr::value(run_at))
                .col_expr(queue_job::Column::StartedAt, Expr::value(Option::<DateTime<Utc>>::None))
                .col_expr(queue_job::Column::LastError, Expr::value(error_details))
                .col_expr(queue_job::Column::UpdatedAt, Expr::value(now))
                .filter(queue_job::Column::Id.eq(job.id))
                .exec(&self.db)
                .await?;

            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempts_made,
                attempts = job.opts.attempts,
                backoff_ms,
                error = error_message,
                "Job failed, retry scheduled"
            );
            counter!("queue_jobs_retried_total", "queue" => job.queue.as_str()).increment(1);
            return Ok(FailOutcome::Retrying { run_at });
        }

        if job.opts.remove_on_fail {
            QueueJobEntity::delete_by_id(job.id).exec(&self.db).await?;
        } else {
            QueueJobEntity::update_many()
                .col_expr(queue_job::Column::Status, Expr::value(STATUS_FAILED))
                .col_expr(queue_job::Column::AttemptsMade, Expr::value(attempts_made as i32))
                .col_expr(queue_job::Column::FinishedAt, Expr::value(now))
                .col_expr(queue_job::Column::LastError, Expr::value(error_details))
                .col_expr(queue_job::Column::UpdatedAt, Expr::value(now))
                .filter(queue_job::Column::Id.eq(job.id))
                .exec(&self.db)
                .await?;
        }

        warn!(
            job_id = %job.id,
            queue = %job.queue,
            attempts_made,
            error = error_message,
            "Job failed permanently"
        );
        counter!("queue_jobs_failed_total", "queue" => job.queue.as_str()).increment(1);
        Ok(FailOutcome::Exhausted)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error_details: serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        QueueJobEntity::update_many()
            .col_expr(queue_job::Column::Status, Expr::value(STATUS_FAILED))
            .col_expr(queue_job::Column::FinishedAt, Expr::value(now))
            .col_expr(queue_job::Column::LastError, Expr::value(error_details))
            .col_expr(queue_job::Column::UpdatedAt, Expr::value(now))
            .filter(queue_job::Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        data: InstallationJobData,
        opts: JobOptions,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let delay_ms = opts.delay_ms.min(MAX_DELAY_MS);
        let run_at = now + Duration::milliseconds(delay_ms as i64);
        let id = Uuid::new_v4();

        let model = QueueJobActiveModel {
            id: Set(id),
            queue: Set(queue.as_str().to_string()),
            payload: Set(serde_json::to_value(&data)?),
            status: Set(STATUS_WAITING.to_string()),
            attempts: Set(opts.attempts.max(1) as i32),
            attempts_made: Set(0),
            delay_ms: Set(delay_ms as i64),
            run_at: Set(run_at.into()),
            remove_on_complete: Set(opts.remove_on_complete),
            remove_on_fail: Set(opts.remove_on_fail),
            started_at: Set(None),
            finished_at: Set(None),
            last_error: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        model.insert(&self.db).await?;

        info!(
            job_id = %id,
            queue = %queue,
            installation_id = data.installation_id,
            tenant_id = %data.tenant_id,
            delay_ms,
            attempts = opts.attempts,
            "Enqueued job"
        );
        counter!("queue_jobs_enqueued_total", "queue" => queue.as_str()).increment(1);

        Ok(id)
    }
}

/// Exponential backoff with jitter for the `attempts_made`-th failure
fn retry_backoff(base_ms: u64, attempts_made: u32) -> u64 {
    let exponent = attempts_made.saturating_sub(1).min(16);
    let backoff = base_ms
        .saturating_mul(1u64 << exponent)
        .min(MAX_RETRY_BACKOFF_MS);
    let jitter = thread_rng().gen_range(0.0..=(RETRY_JITTER_FACTOR * backoff as f64));
    backoff + jitter as u64
}

fn to_job(model: queue_job::Model) -> Result<Job, QueueError> {
    Ok(Job {
        id: model.id,
        queue: model.queue.parse()?,
        data: serde_json::from_value(model.payload)?,
        opts: JobOptions {
            delay_ms: model.delay_ms.max(0) as u64,
            attempts: model.attempts.max(1) as u32,
            remove_on_complete: model.remove_on_complete,
            remove_on_fail: model.remove_on_fail,
        },
        attempts_made: model.attempts_made.max(0) as u32,
        timestamp: model.created_at.with_timezone(&Utc),
    })
}
