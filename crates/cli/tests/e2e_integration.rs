//! End-to-end integration tests for the Busline client.
//!
//! These tests wire producers and consumers from a [`BusConfig`] against the
//! in-memory broker and exercise the full path: publish, partitioning,
//! consume, in-place retries, dead-lettering and offset commits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use busline_broker::MemoryBroker;
use busline_config::BusConfig;
use busline_core::{
    BrokerError, ClassifiedError, Context, Envelope, EnvelopeBuilder, Error, ErrorKind, Handler,
    StartOffset, classify, headers, partition_for_key,
};
use busline_client::{Consumer, ConsumerState, Producer, consumer_from_config, producer_from_config};
use busline_telemetry::BusMetrics;
use serde::{Deserialize, Serialize};

// ── Mock Handler ─────────────────────────────────────────────────────────

/// A handler that records every delivery and fails the keys it is told to.
struct RecordingHandler {
    seen: Mutex<Vec<(String, u32)>>,
    failing_key: Option<String>,
    failure: fn() -> Error,
    fail_times: usize,
    failures: Mutex<usize>,
}

impl RecordingHandler {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failing_key: None,
            failure: transient,
            fail_times: 0,
            failures: Mutex::new(0),
        })
    }

    fn failing(key: &str, failure: fn() -> Error, fail_times: usize) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failing_key: Some(key.to_string()),
            failure,
            fail_times,
            failures: Mutex::new(0),
        })
    }

    fn calls_for(&self, key: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }

    fn payload_order(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[async_trait::async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, _ctx: &Context, envelope: &Envelope) -> Result<(), Error> {
        self.seen
            .lock()
            .unwrap()
            .push((envelope.key.clone(), envelope.retry_count()));

        if self.failing_key.as_deref() == Some(envelope.key.as_str()) {
            let mut failures = self.failures.lock().unwrap();
            if *failures < self.fail_times {
                *failures += 1;
                return Err((self.failure)());
            }
        }
        Ok(())
    }
}

/// Records the `seq` of every tick in arrival order.
struct SequenceHandler {
    seqs: Mutex<Vec<u64>>,
}

#[async_trait::async_trait]
impl Handler for SequenceHandler {
    async fn handle(&self, _ctx: &Context, envelope: &Envelope) -> Result<(), Error> {
        let tick: Tick = envelope.decode_json()?;
        self.seqs.lock().unwrap().push(tick.seq);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Tick {
    seq: u64,
}

fn transient() -> Error {
    Error::Handler(ClassifiedError::transient("connection refused"))
}

fn permanent() -> Error {
    Error::Handler(ClassifiedError::permanent("schema mismatch"))
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn config() -> BusConfig {
    let mut config = BusConfig::default();
    config.producer.topic = "orders".into();
    config.consumer.topic = "orders".into();
    config.consumer.group_id = "billing".into();
    config.consumer.start_offset = StartOffset::Oldest;
    config.consumer.retry_backoff_ms = 0;
    config.consumer.dead_letter_topic = Some("orders.dlq".into());
    config
}

fn producer(broker: &MemoryBroker, config: &BusConfig, metrics: &Arc<BusMetrics>) -> Producer {
    producer_from_config(
        config,
        Arc::new(broker.writer(config.writer_options())),
        Some(Arc::new(broker.writer(config.writer_options()))),
        metrics,
    )
}

fn consumer(
    broker: &MemoryBroker,
    config: &BusConfig,
    handler: Arc<dyn Handler>,
    metrics: &Arc<BusMetrics>,
) -> Arc<Consumer> {
    Arc::new(consumer_from_config(
        config,
        Arc::new(broker.reader(config.reader_options())),
        handler,
        Some(Arc::new(broker.writer(config.writer_options()))),
        metrics,
    ))
}

async fn publish(producer: &Producer, key: &str, payload: &str) {
    let envelope = Envelope::new(key, payload.as_bytes().to_vec());
    producer.publish(&Context::new(), envelope).await.unwrap();
}

/// Run `consumer` until `metrics` shows `commits` commits, then close it.
async fn consume_until(consumer: Arc<Consumer>, metrics: &Arc<BusMetrics>, commits: u64) {
    let running = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.start(&Context::new()).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while metrics.snapshot().commits < commits {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer did not commit in time");

    consumer.close().await.unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

// ── Ordering ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_same_key_is_delivered_in_order() {
    let broker = MemoryBroker::new().with_partitions(4);
    let metrics = Arc::new(BusMetrics::new());
    let config = config();

    let producer = producer(&broker, &config, &metrics);
    for seq in 0..25 {
        let envelope = EnvelopeBuilder::new()
            .key("customer-42")
            .json_payload(&Tick { seq })
            .build()
            .unwrap();
        producer.publish(&Context::new(), envelope).await.unwrap();
    }
    producer.close().await.unwrap();

    // Every record for the key landed on the key's partition.
    let expected = partition_for_key(b"customer-42", 4);
    let records = broker.records("orders");
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| r.partition == expected));

    let handler = Arc::new(SequenceHandler {
        seqs: Mutex::new(Vec::new()),
    });
    consume_until(consumer(&broker, &config, handler.clone(), &metrics), &metrics, 25).await;

    assert_eq!(*handler.seqs.lock().unwrap(), (0..25).collect::<Vec<_>>());
    assert_eq!(
        broker.committed_offset("billing", "orders", expected),
        Some(25)
    );
}

// ── Retries ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_transient_failures_recover_without_dead_letter() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let config = config();

    let producer = producer(&broker, &config, &metrics);
    publish(&producer, "order-1", r#"{"a":1}"#).await;

    let handler = RecordingHandler::failing("order-1", transient, 2);
    consume_until(consumer(&broker, &config, handler.clone(), &metrics), &metrics, 1).await;

    assert_eq!(handler.calls_for("order-1"), 3);
    let retry_counts: Vec<u32> = handler.seen.lock().unwrap().iter().map(|(_, r)| *r).collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert_eq!(broker.record_count("orders.dlq"), 0);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.handled, 1);
    assert_eq!(snapshot.dead_lettered, 0);
}

#[tokio::test]
async fn e2e_exhausted_retries_dead_letter_and_move_on() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let config = config();

    let producer = producer(&broker, &config, &metrics);
    publish(&producer, "order-1", r#"{"a":1}"#).await;
    publish(&producer, "order-2", r#"{"a":2}"#).await;

    let handler = RecordingHandler::failing("order-1", transient, usize::MAX);
    consume_until(consumer(&broker, &config, handler.clone(), &metrics), &metrics, 2).await;

    // One attempt plus three retries, then the loop carries on.
    assert_eq!(handler.calls_for("order-1"), 4);
    assert_eq!(handler.calls_for("order-2"), 1);

    let dlq = broker.records("orders.dlq");
    assert_eq!(dlq.len(), 1);
    let copy = Envelope::from_record(dlq[0].clone());
    assert_eq!(copy.key, "order-1");
    assert_eq!(copy.payload, br#"{"a":1}"#.to_vec());
    assert_eq!(copy.header(headers::RETRY_COUNT), Some("3"));
    assert_eq!(copy.header(headers::ORIGINAL_TOPIC), Some("orders"));

    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(2));
}

// ── Dead-lettering ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_permanent_failure_is_dead_lettered_once() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let config = config();

    let producer = producer(&broker, &config, &metrics);
    publish(&producer, "order-9", r#"{"total":-1}"#).await;

    let handler = RecordingHandler::failing("order-9", permanent, usize::MAX);
    consume_until(consumer(&broker, &config, handler.clone(), &metrics), &metrics, 1).await;

    assert_eq!(handler.calls_for("order-9"), 1);

    let dlq = broker.records("orders.dlq");
    assert_eq!(dlq.len(), 1);
    let copy = Envelope::from_record(dlq[0].clone());
    assert_eq!(copy.header(headers::ORIGINAL_TOPIC), Some("orders"));
    assert_eq!(copy.header(headers::DLQ_CONSUMER_GROUP), Some("billing"));
    assert!(copy.header(headers::DLQ_ERROR).unwrap().contains("schema mismatch"));
    let stamped = copy.header(headers::DLQ_TIMESTAMP).unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(stamped).is_ok());

    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(1));
    assert_eq!(metrics.snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn e2e_producer_dead_letters_failed_writes() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let mut config = config();
    config.producer.dead_letter_topic = Some("orders.publish-dlq".into());

    let producer = producer(&broker, &config, &metrics);
    // More faults than the writer's attempts.
    broker.fail_writes(BrokerError::Unavailable("broker down".into()), 3);

    let err = producer
        .publish(&Context::new(), Envelope::new("order-1", b"{}".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Broker(_)));
    assert_eq!(classify(&err), ErrorKind::Transient);

    assert_eq!(broker.record_count("orders"), 0);
    let dlq = broker.records("orders.publish-dlq");
    assert_eq!(dlq.len(), 1);
    let copy = Envelope::from_record(dlq[0].clone());
    assert_eq!(copy.header(headers::ORIGINAL_TOPIC), Some("orders"));
    assert!(copy.header(headers::DLQ_ERROR).unwrap().contains("broker down"));
    assert_eq!(copy.header(headers::DLQ_CONSUMER_GROUP), None);
}

// ── Producer lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_publish_after_close_never_reaches_broker() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let producer = Arc::new(producer(&broker, &config(), &metrics));
    producer.close().await.unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let producer = producer.clone();
            tokio::spawn(async move {
                producer
                    .publish(&Context::new(), Envelope::new(format!("k-{i}"), b"x".to_vec()))
                    .await
            })
        })
        .collect();

    for task in tasks {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ProducerClosed)));
    }
    assert_eq!(broker.write_calls(), 0);

    // Closing twice is fine.
    producer.close().await.unwrap();
}

#[tokio::test]
async fn e2e_invalid_envelopes_are_rejected_before_write() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let producer = producer(&broker, &config(), &metrics);
    let ctx = Context::new();

    let err = producer
        .publish(&ctx, Envelope::new("", b"payload".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvelope(_)));

    let err = producer
        .publish(&ctx, Envelope::new("order-1", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvelope(_)));

    assert_eq!(broker.write_calls(), 0);
    assert_eq!(metrics.snapshot().published, 0);
}

#[tokio::test]
async fn e2e_batch_publish_is_one_write() {
    let broker = MemoryBroker::new().with_partitions(3);
    let metrics = Arc::new(BusMetrics::new());
    let producer = producer(&broker, &config(), &metrics);

    let batch = vec![
        Envelope::new("a", b"1".to_vec()),
        Envelope::new("", b"dropped".to_vec()),
        Envelope::new("b", b"2".to_vec()),
        Envelope::new("c", b"3".to_vec()),
    ];
    let written = producer.publish_batch(&Context::new(), batch).await.unwrap();

    assert_eq!(written, 3);
    assert_eq!(broker.write_calls(), 1);
    assert_eq!(broker.record_count("orders"), 3);
}

// ── Classification ───────────────────────────────────────────────────────

#[test]
fn e2e_classifier_examples() {
    let cases: Vec<(Error, ErrorKind)> = vec![
        (Error::Internal("dial tcp: connection refused".into()), ErrorKind::Transient),
        (Error::Internal("i/o timeout".into()), ErrorKind::Transient),
        (Error::Internal("failed to deserialize payload".into()), ErrorKind::Permanent),
        (Error::Internal("something strange".into()), ErrorKind::Permanent),
        (
            Error::Handler(ClassifiedError::business("insufficient funds")),
            ErrorKind::Business,
        ),
        (
            Error::Broker(BrokerError::LeaderNotAvailable {
                topic: "orders".into(),
                partition: 0,
            }),
            ErrorKind::Transient,
        ),
    ];

    for (err, expected) in cases {
        assert_eq!(classify(&err), expected, "classifying {err}");
    }
}

// ── Config ───────────────────────────────────────────────────────────────

#[test]
fn e2e_default_toml_round_trips_through_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, BusConfig::default_toml()).unwrap();

    let loaded = BusConfig::load_from(&path).unwrap();
    assert_eq!(loaded.consumer.max_retries, 3);
    assert_eq!(loaded.consumer.group_id, BusConfig::default().consumer.group_id);
}

#[tokio::test]
async fn e2e_handler_ok_commits_every_record() {
    let broker = MemoryBroker::new();
    let metrics = Arc::new(BusMetrics::new());
    let config = config();

    let producer = producer(&broker, &config, &metrics);
    for key in ["a", "b", "c"] {
        publish(&producer, key, "{}").await;
    }

    let handler = RecordingHandler::ok();
    consume_until(consumer(&broker, &config, handler.clone(), &metrics), &metrics, 3).await;

    assert_eq!(handler.payload_order(), vec!["a", "b", "c"]);
    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(3));
    assert_eq!(metrics.snapshot().handled, 3);
}
