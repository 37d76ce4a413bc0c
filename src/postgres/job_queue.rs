//! A durable delivery queue in a PostgreSQL table.
//!
//! Rows follow the familiar delayed-job layout: lower `priority` runs
//! first, `run_at` delays execution, `locked_at`/`locked_by` mark a claim
//! and `failed_at` dead-letters a job that will not be retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::connection::PgConnection;
use crate::config::QueueConfig;
use crate::event::EnqueueOptions;
use crate::scheduler::{DeliveryTask, JobScheduler};
use crate::{Error, Result};

/// A job claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    /// Attempts made before this one.
    pub attempts: i32,
    pub task: std::result::Result<DeliveryTask, String>,
}

pub struct PgJobQueue {
    connection: PgConnection,
    table: String,
    worker_name: String,
}

impl PgJobQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let table = checked_identifier(&config.table)?;
        let connection = PgConnection::connect(&config.postgres_url()).await?;

        Ok(Self {
            connection,
            table,
            worker_name: config.worker_name.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id BIGSERIAL PRIMARY KEY,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                handler TEXT NOT NULL,
                last_error TEXT,
                run_at TIMESTAMPTZ NOT NULL,
                locked_at TIMESTAMPTZ,
                locked_by TEXT,
                failed_at TIMESTAMPTZ,
                queue TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS {t}_ready_idx ON {t} (priority, run_at) WHERE failed_at IS NULL;",
            t = self.table
        );

        self.connection.client.batch_execute(&ddl).await?;
        info!("Job table '{}' is ready", self.table);
        Ok(())
    }

    /// Locks the next runnable job, skipping rows other workers hold.
    /// Claims older than `stale_after` are considered abandoned.
    #[instrument(skip(self))]
    pub async fn claim_next(
        &self,
        queues: Option<&[String]>,
        stale_after: chrono::Duration,
    ) -> Result<Option<ClaimedJob>> {
        let sql = format!(
            "UPDATE {t} SET locked_at = now(), locked_by = $1, updated_at = now()
             WHERE id = (
                SELECT id FROM {t}
                WHERE failed_at IS NULL
                  AND run_at <= now()
                  AND (locked_at IS NULL OR locked_at < $2)
                  AND ($3::text[] IS NULL OR queue = ANY($3))
                ORDER BY priority ASC, run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING id, attempts, handler",
            t = self.table
        );

        let stale_before = Utc::now() - stale_after;
        let queues: Option<Vec<String>> = queues.map(<[String]>::to_vec);
        let row = self
            .connection
            .client
            .query_opt(&sql, &[&self.worker_name, &stale_before, &queues])
            .await?;

        Ok(row.map(|row| {
            let handler: String = row.get(2);
            let task = serde_json::from_str::<DeliveryTask>(&handler).map_err(|e| e.to_string());
            let job = ClaimedJob {
                id: row.get(0),
                attempts: row.get(1),
                task,
            };
            debug!(job_id = job.id, attempts = job.attempts, "Claimed job");
            job
        }))
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        self.connection.client.execute(&sql, &[&id]).await?;
        Ok(())
    }

    /// Releases the claim and schedules another attempt at `run_at`.
    pub async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempts = $2, last_error = $3, run_at = $4,
                locked_at = NULL, locked_by = NULL, updated_at = now()
             WHERE id = $1",
            self.table
        );
        self.connection
            .client
            .execute(&sql, &[&id, &attempts, &error, &run_at])
            .await?;
        Ok(())
    }

    /// Dead-letters a job: it stays in the table for inspection but is
    /// never claimed again.
    pub async fn fail_permanently(&self, id: i64, attempts: i32, error: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempts = $2, last_error = $3, failed_at = now(),
                locked_at = NULL, locked_by = NULL, updated_at = now()
             WHERE id = $1",
            self.table
        );
        self.connection
            .client
            .execute(&sql, &[&id, &attempts, &error])
            .await?;
        warn!(job_id = id, attempts, "Job dead-lettered: {}", error);
        Ok(())
    }

    /// Number of jobs that can still run.
    pub async fn pending_count(&self) -> Result<i64> {
        let sql = format!("SELECT count(*) FROM {} WHERE failed_at IS NULL", self.table);
        let row = self.connection.client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl JobScheduler for PgJobQueue {
    async fn enqueue(&self, task: DeliveryTask, options: EnqueueOptions) -> Result<()> {
        if self.connection.is_closed() {
            return Err(Error::Scheduler("job queue connection is closed".to_string()));
        }

        let handler = serde_json::to_string(&task)?;
        let priority = options.priority.unwrap_or(0);
        let run_at = options.run_at.unwrap_or_else(Utc::now);
        let sql = format!(
            "INSERT INTO {} (priority, handler, run_at, queue) VALUES ($1, $2, $3, $4)",
            self.table
        );

        self.connection
            .client
            .execute(&sql, &[&priority, &handler, &run_at, &options.queue])
            .await?;

        debug!(
            records = task.len(),
            priority,
            queue = ?options.queue,
            "Enqueued delivery job"
        );
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn checked_identifier(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(name.to_string())
    } else {
        Err(Error::Config(format!("invalid job table name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::SerializedRecord;

    #[test]
    fn test_checked_identifier() {
        assert!(checked_identifier("journaled_delivery_jobs").is_ok());
        assert!(checked_identifier("_jobs2").is_ok());
        assert!(checked_identifier("").is_err());
        assert!(checked_identifier("2jobs").is_err());
        assert!(checked_identifier("jobs; DROP TABLE users").is_err());
        assert!(checked_identifier("Jobs").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_enqueue_claim_complete() {
        let config = QueueConfig {
            table: format!("journaled_test_jobs_{}", std::process::id()),
            ..QueueConfig::default()
        };
        let queue = PgJobQueue::connect(&config).await.unwrap();
        queue.ensure_schema().await.unwrap();

        let task = DeliveryTask::new(None, vec![SerializedRecord::new("{}", "k")]);
        queue
            .enqueue(task.clone(), EnqueueOptions::default().with_priority(1))
            .await
            .unwrap();

        let job = queue
            .claim_next(None, chrono::Duration::hours(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.task.unwrap(), task);

        assert!(queue
            .claim_next(None, chrono::Duration::hours(4))
            .await
            .unwrap()
            .is_none());

        queue.complete(job.id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);

        let drop = format!("DROP TABLE {}", queue.table());
        queue.connection.client.batch_execute(&drop).await.unwrap();
    }
}
