//! Turning events into delivery jobs.
//!
//! [`BulkWriter`] validates and serializes a whole collection up front,
//! splits the records into chunks of at most `bulk_delivery_chunk_limit`
//! and enqueues one delivery task per chunk. A single invalid event fails
//! the whole call before anything is enqueued.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::event::{EnqueueOptions, JournalableEvent};
use crate::scheduler::{DeliveryTask, JobScheduler};
use crate::serializer::{self, SerializedRecord, Serializer};
use crate::{Error, Result};

/// A delivery task and the resolved options it will be enqueued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelivery {
    pub task: DeliveryTask,
    pub options: EnqueueOptions,
}

pub struct BulkWriter {
    serializer: Serializer,
    scheduler: Arc<dyn JobScheduler>,
    config: Arc<Config>,
}

impl BulkWriter {
    pub fn new(serializer: Serializer, scheduler: Arc<dyn JobScheduler>, config: Arc<Config>) -> Self {
        Self {
            serializer,
            scheduler,
            config,
        }
    }

    /// Validates, serializes and chunks `events` without enqueuing anything.
    ///
    /// Chunks keep input order. With a per-batch delay configured, chunk `i`
    /// runs at `base + i * delay`, where `base` is the caller's `run_at` or
    /// `now`.
    pub fn plan<E: JournalableEvent>(
        &self,
        events: &[E],
        app_name: Option<&str>,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlannedDelivery>> {
        let limit = self.config.bulk_delivery_chunk_limit;
        if limit == 0 {
            return Err(Error::Config(
                "bulk_delivery_chunk_limit must be at least 1".to_string(),
            ));
        }

        let records = events
            .iter()
            .map(|event| {
                let validated = self.serializer.validate(event)?;
                serializer::serialize(&validated)
            })
            .collect::<Result<Vec<SerializedRecord>>>()?;

        let app_name = app_name
            .map(str::to_string)
            .or_else(|| self.config.default_app_name.clone());
        let resolved = options.resolve(&self.config);
        let delay = self.config.per_batch_delay();
        let base = resolved.run_at.unwrap_or(now);

        let planned = records
            .chunks(limit)
            .enumerate()
            .map(|(index, chunk)| {
                let mut options = resolved.clone();
                if let Some(delay) = delay {
                    options.run_at = Some(staggered_run_at(base, delay, index)?);
                }
                Ok(PlannedDelivery {
                    task: DeliveryTask::new(app_name.clone(), chunk.to_vec()),
                    options,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            events = events.len(),
            batches = planned.len(),
            "Planned bulk delivery"
        );
        Ok(planned)
    }

    /// Plans `events` and enqueues every chunk. Returns the number of
    /// delivery tasks enqueued.
    #[instrument(skip(self, events, options), fields(events = events.len()))]
    pub async fn journal<E: JournalableEvent>(
        &self,
        events: &[E],
        app_name: Option<&str>,
        options: &EnqueueOptions,
    ) -> Result<usize> {
        let planned = self.plan(events, app_name, options, Utc::now())?;
        let batches = planned.len();

        for delivery in planned {
            self.scheduler.enqueue(delivery.task, delivery.options).await?;
        }

        info!(batches, "Enqueued bulk deliveries");
        Ok(batches)
    }
}

/// `base + index * delay`, or a config error when that leaves chrono's range.
fn staggered_run_at(
    base: DateTime<Utc>,
    delay: chrono::Duration,
    index: usize,
) -> Result<DateTime<Utc>> {
    i32::try_from(index)
        .ok()
        .and_then(|index| delay.checked_mul(index))
        .and_then(|offset| base.checked_add_signed(offset))
        .ok_or_else(|| {
            Error::Config(format!(
                "per_batch_delay_ms pushes batch {} past the representable time range",
                index
            ))
        })
}

/// Journals one event at a time, using the event's own app name and
/// enqueue options.
pub struct Writer {
    serializer: Serializer,
    scheduler: Arc<dyn JobScheduler>,
    config: Arc<Config>,
}

impl Writer {
    pub fn new(serializer: Serializer, scheduler: Arc<dyn JobScheduler>, config: Arc<Config>) -> Self {
        Self {
            serializer,
            scheduler,
            config,
        }
    }

    pub async fn journal<E: JournalableEvent + ?Sized>(&self, event: &E) -> Result<()> {
        let validated = self.serializer.validate(event)?;
        let record = serializer::serialize(&validated)?;

        let app_name = validated
            .app_name()
            .map(str::to_string)
            .or_else(|| self.config.default_app_name.clone());
        let options = validated.enqueue_opts().resolve(&self.config);

        debug!(
            schema = validated.schema_name(),
            partition_key = validated.partition_key(),
            "Enqueuing delivery"
        );
        self.scheduler
            .enqueue(DeliveryTask::new(app_name, vec![record]), options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{to_attributes, Attributes, JournalEvent};
    use crate::scheduler::InMemoryScheduler;
    use crate::schema::SchemaRegistry;
    use chrono::TimeZone;
    use serde_json::json;

    fn valid_attributes(foo: &str) -> Attributes {
        to_attributes(&json!({
            "id": "FAKE_UUID",
            "event_type": "fake_event",
            "created_at": "2020-03-18T17:55:00.000Z",
            "foo": foo
        }))
        .unwrap()
    }

    fn event(key: &str) -> JournalEvent {
        JournalEvent::new("fake_schema_name", key, valid_attributes(key))
    }

    fn serializer() -> Serializer {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                "fake_schema_name",
                &json!({
                    "type": "object",
                    "properties": { "foo": { "type": "string" } },
                    "required": ["foo"]
                }),
            )
            .unwrap();
        Serializer::new(Arc::new(registry))
    }

    fn setup(config: Config) -> (BulkWriter, Arc<InMemoryScheduler>) {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let writer = BulkWriter::new(serializer(), scheduler.clone(), Arc::new(config));
        (writer, scheduler)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_plan_single_batch() {
        let (writer, _) = setup(Config::default());
        let events = vec![event("key_1"), event("key_2")];

        let planned = writer
            .plan(&events, Some("my_app"), &EnqueueOptions::default(), now())
            .unwrap();

        assert_eq!(planned.len(), 1);
        let task = &planned[0].task;
        assert_eq!(task.app_name.as_deref(), Some("my_app"));
        let keys: Vec<_> = task.records.iter().map(|r| r.partition_key.as_str()).collect();
        assert_eq!(keys, vec!["key_1", "key_2"]);
        assert_eq!(planned[0].options.priority, Some(20));
        assert!(planned[0].options.run_at.is_none());
    }

    #[test]
    fn test_plan_chunks_cover_every_record_once() {
        for (limit, count) in [(1, 2), (2, 5), (3, 3), (500, 1001), (7, 0)] {
            let (writer, _) = setup(Config {
                bulk_delivery_chunk_limit: limit,
                ..Config::default()
            });
            let events: Vec<_> = (0..count).map(|i| event(&format!("key_{}", i))).collect();

            let planned = writer
                .plan(&events, None, &EnqueueOptions::default(), now())
                .unwrap();

            assert_eq!(planned.len(), (count + limit - 1) / limit);
            assert!(planned.iter().all(|p| p.task.len() <= limit));
            let keys: Vec<String> = planned
                .iter()
                .flat_map(|p| p.task.records.iter().map(|r| r.partition_key.clone()))
                .collect();
            let expected: Vec<String> = (0..count).map(|i| format!("key_{}", i)).collect();
            assert_eq!(keys, expected);
        }
    }

    #[test]
    fn test_plan_staggers_run_at() {
        let (writer, _) = setup(Config {
            bulk_delivery_chunk_limit: 1,
            per_batch_delay_ms: Some(1_000),
            ..Config::default()
        });
        let events = vec![event("a"), event("b"), event("c")];

        let planned = writer
            .plan(&events, None, &EnqueueOptions::default(), now())
            .unwrap();

        let run_ats: Vec<_> = planned.iter().map(|p| p.options.run_at.unwrap()).collect();
        assert_eq!(
            run_ats,
            vec![
                now(),
                now() + chrono::Duration::seconds(1),
                now() + chrono::Duration::seconds(2)
            ]
        );
    }

    #[test]
    fn test_plan_rejects_zero_chunk_limit() {
        let (writer, _) = setup(Config {
            bulk_delivery_chunk_limit: 0,
            ..Config::default()
        });

        let err = writer
            .plan(&[event("key_1")], None, &EnqueueOptions::default(), now())
            .unwrap_err();

        assert!(matches!(err, Error::Config(msg) if msg.contains("bulk_delivery_chunk_limit")));
    }

    #[tokio::test]
    async fn test_journal_with_zero_chunk_limit_enqueues_nothing() {
        let (writer, scheduler) = setup(Config {
            bulk_delivery_chunk_limit: 0,
            ..Config::default()
        });

        assert!(writer
            .journal(&[event("key_1")], None, &EnqueueOptions::default())
            .await
            .is_err());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_plan_rejects_delay_past_time_range() {
        let (writer, _) = setup(Config {
            bulk_delivery_chunk_limit: 1,
            per_batch_delay_ms: Some(10_000_000_000_000_000),
            ..Config::default()
        });
        let events = vec![event("a"), event("b")];

        let err = writer
            .plan(&events, None, &EnqueueOptions::default(), now())
            .unwrap_err();

        assert!(matches!(err, Error::Config(msg) if msg.contains("per_batch_delay_ms")));
    }

    #[test]
    fn test_plan_fails_whole_collection_on_one_bad_event() {
        let (writer, _) = setup(Config::default());
        let mut bad = event("bad");
        bad.attributes.remove("id");
        let events = vec![event("good"), bad];

        assert!(writer
            .plan(&events, None, &EnqueueOptions::default(), now())
            .is_err());
    }

    #[tokio::test]
    async fn test_journal_enqueues_nothing_when_an_event_is_invalid() {
        let (writer, scheduler) = setup(Config::default());
        let events = vec![event("good"), JournalEvent::new("", "", Attributes::new())];

        let err = writer
            .journal(&events, Some("my_app"), &EnqueueOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("non-empty response"));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_journal_uses_given_priority_and_default_queue() {
        let (writer, scheduler) = setup(Config {
            bulk_delivery_chunk_limit: 1,
            job_queue: Some("journaled".to_string()),
            ..Config::default()
        });
        let events = vec![event("key_1"), event("key_2")];

        let batches = writer
            .journal(&events, Some("my_app"), &EnqueueOptions::default().with_priority(13))
            .await
            .unwrap();

        assert_eq!(batches, 2);
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            assert_eq!(job.options.priority, Some(13));
            assert_eq!(job.options.queue.as_deref(), Some("journaled"));
            assert_eq!(job.task.len(), 1);
        }
        assert_eq!(jobs[0].task.records[0].partition_key, "key_1");
        assert_eq!(jobs[1].task.records[0].partition_key, "key_2");
    }

    #[tokio::test]
    async fn test_single_writer_uses_event_options() {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let writer = Writer::new(
            serializer(),
            scheduler.clone(),
            Arc::new(Config {
                job_priority: 999,
                ..Config::default()
            }),
        );
        let event = event("key_1")
            .with_app_name("billing")
            .with_enqueue_opts(EnqueueOptions::default().with_queue("slow"));

        writer.journal(&event).await.unwrap();

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task.app_name.as_deref(), Some("billing"));
        assert_eq!(jobs[0].options.priority, Some(999));
        assert_eq!(jobs[0].options.queue.as_deref(), Some("slow"));
    }
}
