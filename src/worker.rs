//! Runs delivery jobs from a durable queue.
//!
//! The worker claims one job at a time, hands its task to the
//! [`DeliveryAgent`] and records the outcome. Failed jobs are retried with
//! a polynomial backoff until they either succeed, fail with a
//! non-retryable error or run out of attempts, after which they are
//! dead-lettered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryAgent, DeliveryReport};
use crate::postgres::{ClaimedJob, PgJobQueue};
use crate::{Error, Result};

/// Claims older than this are treated as abandoned by a crashed worker.
const STALE_CLAIM_HOURS: i64 = 4;

/// Storage side of the worker loop.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn claim(&self, queues: Option<&[String]>) -> Result<Option<ClaimedJob>>;
    async fn complete(&self, id: i64) -> Result<()>;
    async fn reschedule(&self, id: i64, attempts: i32, error: &str, run_at: DateTime<Utc>) -> Result<()>;
    async fn fail_permanently(&self, id: i64, attempts: i32, error: &str) -> Result<()>;
}

#[async_trait]
impl JobStore for PgJobQueue {
    async fn claim(&self, queues: Option<&[String]>) -> Result<Option<ClaimedJob>> {
        self.claim_next(queues, chrono::Duration::hours(STALE_CLAIM_HOURS))
            .await
    }

    async fn complete(&self, id: i64) -> Result<()> {
        PgJobQueue::complete(self, id).await
    }

    async fn reschedule(&self, id: i64, attempts: i32, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        PgJobQueue::reschedule(self, id, attempts, error, run_at).await
    }

    async fn fail_permanently(&self, id: i64, attempts: i32, error: &str) -> Result<()> {
        PgJobQueue::fail_permanently(self, id, attempts, error).await
    }
}

/// What to do with a job whose delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Reschedule { attempts: i32, run_at: DateTime<Utc> },
    DeadLetter { attempts: i32 },
}

/// Delay before retry number `attempts`: `attempts^4 + 5` seconds.
pub fn retry_delay(attempts: i32) -> chrono::Duration {
    let n = i64::from(attempts.max(0));
    chrono::Duration::seconds(n.saturating_pow(4).saturating_add(5))
}

/// Decides the fate of a failed job. `attempts_before` counts the attempts
/// made before the one that just failed.
pub fn failure_action(
    error: &Error,
    attempts_before: i32,
    max_attempts: i32,
    now: DateTime<Utc>,
) -> FailureAction {
    let attempts = attempts_before.saturating_add(1);

    if !error.is_retryable() || attempts >= max_attempts {
        FailureAction::DeadLetter { attempts }
    } else {
        FailureAction::Reschedule {
            attempts,
            run_at: now + retry_delay(attempts),
        }
    }
}

/// Result of one pass of [`DeliveryWorker::work_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was ready to run.
    Idle,
    Completed(DeliveryReport),
    Retrying { job_id: i64, run_at: DateTime<Utc> },
    DeadLettered { job_id: i64 },
}

pub struct DeliveryWorker {
    store: Arc<dyn JobStore>,
    agent: DeliveryAgent,
    queues: Option<Vec<String>>,
    max_attempts: i32,
    poll_interval: Duration,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn JobStore>, agent: DeliveryAgent, max_attempts: i32, poll_interval: Duration) -> Self {
        Self {
            store,
            agent,
            queues: None,
            max_attempts,
            poll_interval,
        }
    }

    /// Restricts the worker to jobs on the given queues.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = if queues.is_empty() { None } else { Some(queues) };
        self
    }

    /// Claims and runs at most one job.
    pub async fn work_one(&self) -> Result<WorkOutcome> {
        let job = match self.store.claim(self.queues.as_deref()).await? {
            Some(job) => job,
            None => return Ok(WorkOutcome::Idle),
        };

        let task = match job.task {
            Ok(task) => task,
            Err(detail) => {
                let message = format!("undecodable job payload: {}", detail);
                self.store
                    .fail_permanently(job.id, job.attempts.saturating_add(1), &message)
                    .await?;
                return Ok(WorkOutcome::DeadLettered { job_id: job.id });
            }
        };

        match self.agent.deliver(&task).await {
            Ok(report) => {
                self.store.complete(job.id).await?;
                debug!(job_id = job.id, ?report, "Job completed");
                Ok(WorkOutcome::Completed(report))
            }
            Err(e) => {
                let message = e.to_string();
                match failure_action(&e, job.attempts, self.max_attempts, Utc::now()) {
                    FailureAction::Reschedule { attempts, run_at } => {
                        warn!(job_id = job.id, attempts, %run_at, "Delivery failed, will retry: {}", message);
                        self.store.reschedule(job.id, attempts, &message, run_at).await?;
                        Ok(WorkOutcome::Retrying {
                            job_id: job.id,
                            run_at,
                        })
                    }
                    FailureAction::DeadLetter { attempts } => {
                        error!(job_id = job.id, attempts, "Delivery failed permanently: {}", message);
                        self.store.fail_permanently(job.id, attempts, &message).await?;
                        Ok(WorkOutcome::DeadLettered { job_id: job.id })
                    }
                }
            }
        }
    }

    /// Works jobs until `shutdown` resolves, sleeping for the poll interval
    /// whenever the queue is empty or unreachable. A job in flight always
    /// runs to completion before the worker stops.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(queues = ?self.queues, "Delivery worker started");

        loop {
            let pause = match self.work_one().await {
                Ok(WorkOutcome::Idle) => self.poll_interval,
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    error!(error = %e, "Worker pass failed");
                    self.poll_interval
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Delivery worker stopped");
        Ok(())
    }
}
