//! Queue workers
//!
//! One [`QueueWorker`] polls one named queue: each tick claims due jobs,
//! runs them concurrently up to the queue's limit, and acknowledges every
//! delivery back to the queue (complete, or fail with retry/backoff).

use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::queue::db::FailOutcome;
use crate::queue::{DbJobQueue, Job, JobHandler, QueueError, QueueName};
use crate::telemetry::{TraceContext, with_trace_context};

/// Polling and concurrency settings of one worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Milliseconds between polls
    pub tick_ms: u64,
    /// Maximum number of jobs running at once
    pub concurrency: usize,
    /// Maximum number of jobs claimed per poll
    pub claim_batch: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            concurrency: 4,
            claim_batch: 20,
        }
    }
}

/// Background worker bound to one queue
#[derive(Clone)]
pub struct QueueWorker {
    queue_name: QueueName,
    queue: DbJobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(
        queue_name: QueueName,
        queue: DbJobQueue,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue_name,
            queue,
            handler,
            config,
            permits,
        }
    }

    /// Run the worker loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(queue = %self.queue_name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(config = ?self.config, "Starting queue worker");
        let tick_interval = Duration::from_millis(self.config.tick_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue worker shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    match self.run_due_jobs().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Processed jobs"),
                        Err(err) => error!(error = %err, "Queue worker tick failed"),
                    }
                    histogram!("queue_worker_tick_duration_ms", "queue" => self.queue_name.as_str())
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Queue worker stopped");
    }

    /// Claim due jobs and run them to completion; returns how many ran.
    pub async fn run_due_jobs(&self) -> Result<usize, QueueError> {
        let jobs = self
            .queue
            .claim_due(self.queue_name, self.config.claim_batch)
            .await?;
        let count = jobs.len();

        let mut handles = Vec::with_capacity(count);
        for job in jobs {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                warn!("Worker semaphore closed, leaving claimed jobs for retry");
                break;
            };
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.run_single_job(job).await;
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Job task panicked");
            }
        }

        Ok(count)
    }

    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            installation_id = job.data.installation_id,
            tenant_id = %job.data.tenant_id,
            attempt = job.attempts_made + 1,
        )
    )]
    async fn run_single_job(&self, job: Job) {
        let started = Instant::now();

        let context = TraceContext::for_job(job.id, job.attempts_made + 1);
        let outcome = with_trace_context(context, self.handler.handle(&job)).await;
        histogram!("queue_job_duration_ms", "queue" => self.queue_name.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        let ack = match outcome {
            Ok(()) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
                self.queue.complete(&job).await
            }
            Err(err) => match self.queue.fail(&job, &err.to_string()).await {
                Ok(FailOutcome::Retrying { run_at }) => {
                    debug!(%run_at, "Job handed back for retry");
                    Ok(())
                }
                Ok(FailOutcome::Exhausted) => {
                    error!(error = %err, "Job exhausted its attempts");
                    Ok(())
                }
                Err(queue_err) => Err(queue_err),
            },
        };

        if let Err(err) = ack {
            error!(error = %err, "Failed to acknowledge job");
        }
    }
}
