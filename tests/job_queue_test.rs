mod common;

use common::{get_test_config, widget_event, widget_registry};
use journaled::postgres::PgJobQueue;
use journaled::stream::{PutRecordsOutput, RecordOutcome, StaticStreamNames, PROVISIONED_THROUGHPUT_EXCEEDED};
use journaled::testing::ScriptedEndpoint;
use journaled::worker::WorkOutcome;
use journaled::{BulkWriter, DeliveryAgent, DeliveryWorker, EnqueueOptions, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;

fn config_for(test: &str) -> journaled::Config {
    let mut config = get_test_config();
    config.queue.table = format!("{}_{}", config.queue.table, test);
    config
}

async fn drop_table(config: &journaled::Config) {
    let (client, connection) = tokio_postgres::connect(&config.queue.postgres_url(), NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {}", config.queue.table))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored job_queue_test
async fn test_journal_then_work_through_postgres() {
    tracing_subscriber::fmt()
        .with_env_filter("journaled=debug")
        .try_init()
        .ok();

    let config = Arc::new(config_for("flow"));
    let queue = Arc::new(PgJobQueue::connect(&config.queue).await.unwrap());
    queue.ensure_schema().await.unwrap();

    let writer = BulkWriter::new(
        Serializer::new(Arc::new(widget_registry())),
        queue.clone(),
        config.clone(),
    );
    let events: Vec<_> = (0..3).map(|i| widget_event(&format!("w{}", i))).collect();
    writer
        .journal(&events, None, &EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(queue.pending_count().await.unwrap(), 1);

    // First attempt: one record throttled, so a follow-up job is enqueued.
    let endpoint = Arc::new(ScriptedEndpoint::new().respond(PutRecordsOutput::from_records(vec![
        RecordOutcome::accepted("0", "1"),
        RecordOutcome::rejected(PROVISIONED_THROUGHPUT_EXCEEDED, "Rate exceeded"),
        RecordOutcome::accepted("0", "2"),
    ])));
    let agent = DeliveryAgent::new(
        endpoint.clone(),
        Arc::new(StaticStreamNames::new().with_stream(None, "widgets")),
        queue.clone(),
        config.clone(),
    );
    let worker = DeliveryWorker::new(queue.clone(), agent, config.queue.max_attempts, Duration::from_millis(10));

    assert!(matches!(worker.work_one().await.unwrap(), WorkOutcome::Completed(_)));
    assert_eq!(queue.pending_count().await.unwrap(), 1);

    assert!(matches!(worker.work_one().await.unwrap(), WorkOutcome::Completed(_)));
    assert_eq!(worker.work_one().await.unwrap(), WorkOutcome::Idle);
    assert_eq!(queue.pending_count().await.unwrap(), 0);

    let calls = endpoint.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.len(), 1);
    assert_eq!(calls[1].1[0].partition_key, "w1");

    drop_table(&config).await;
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored job_queue_test
async fn test_failed_job_is_rescheduled_into_the_future() {
    let config = Arc::new(config_for("backoff"));
    let queue = Arc::new(PgJobQueue::connect(&config.queue).await.unwrap());
    queue.ensure_schema().await.unwrap();

    let writer = BulkWriter::new(
        Serializer::new(Arc::new(widget_registry())),
        queue.clone(),
        config.clone(),
    );
    writer
        .journal(&[widget_event("w0")], None, &EnqueueOptions::default())
        .await
        .unwrap();

    let endpoint = Arc::new(ScriptedEndpoint::new().respond(PutRecordsOutput::from_records(vec![
        RecordOutcome::rejected(PROVISIONED_THROUGHPUT_EXCEEDED, "Rate exceeded"),
    ])));
    let agent = DeliveryAgent::new(
        endpoint,
        Arc::new(StaticStreamNames::new().with_stream(None, "widgets")),
        queue.clone(),
        config.clone(),
    );
    let worker = DeliveryWorker::new(queue.clone(), agent, config.queue.max_attempts, Duration::from_millis(10));

    assert!(matches!(worker.work_one().await.unwrap(), WorkOutcome::Retrying { .. }));
    // Backed off, so nothing is ready right now.
    assert_eq!(worker.work_one().await.unwrap(), WorkOutcome::Idle);
    assert_eq!(queue.pending_count().await.unwrap(), 1);

    drop_table(&config).await;
}
