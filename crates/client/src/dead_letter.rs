//! Dead-letter routing shared by the producer and the consumer.

use busline_core::{
    BrokerError, BrokerWriter, Context, Envelope, Error, Result, headers, partition_for_key,
};
use busline_telemetry::BusMetrics;
use chrono::{SecondsFormat, Utc};
use std::fmt::Display;
use std::sync::Arc;

/// Why an envelope is being dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    error: String,
    consumer_group: Option<String>,
}

impl Failure {
    pub fn new(error: impl Display) -> Self {
        Self {
            error: error.to_string(),
            consumer_group: None,
        }
    }

    /// Set on the consume path so operators can tell which group gave up.
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn consumer_group(&self) -> Option<&str> {
        self.consumer_group.as_deref()
    }
}

/// Writes annotated copies of failed envelopes to a dead-letter topic.
///
/// Cloning shares the writer, so one router can serve a producer and a
/// consumer at the same time.
#[derive(Clone)]
pub struct DeadLetterRouter {
    writer: Arc<dyn BrokerWriter>,
    topic: String,
    metrics: Option<Arc<BusMetrics>>,
}

impl DeadLetterRouter {
    pub fn new(writer: Arc<dyn BrokerWriter>, topic: impl Into<String>) -> Self {
        Self {
            writer,
            topic: topic.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The copy that lands on the dead-letter topic: original key, payload
    /// and headers plus the `dlq-*` annotations.
    pub fn annotate(&self, envelope: &Envelope, failure: &Failure) -> Envelope {
        let mut copy = envelope.clone();
        let original_topic = envelope.topic.clone().unwrap_or_default();
        copy.set_header(headers::ORIGINAL_TOPIC, original_topic);
        copy.set_header(headers::DLQ_ERROR, failure.error());
        copy.set_header(
            headers::DLQ_TIMESTAMP,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if let Some(group) = failure.consumer_group() {
            copy.set_header(headers::DLQ_CONSUMER_GROUP, group);
        }
        copy.topic = Some(self.topic.clone());
        copy.partition = None;
        copy.offset = None;
        copy
    }

    /// Publish an annotated copy of `envelope`. Errors are returned to the
    /// caller, which decides whether they matter.
    pub async fn route(&self, ctx: &Context, envelope: &Envelope, failure: &Failure) -> Result<()> {
        let annotated = self.annotate(envelope, failure);
        let result = self.write(ctx, &annotated).await;

        let origin = envelope.topic.as_deref().unwrap_or_default();
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter(origin, result.is_ok());
        }

        match &result {
            Ok(()) => tracing::info!(
                dlq_topic = %self.topic,
                original_topic = %origin,
                key = %envelope.key,
                error = %failure.error(),
                "Envelope dead-lettered"
            ),
            Err(e) => tracing::error!(
                dlq_topic = %self.topic,
                original_topic = %origin,
                key = %envelope.key,
                error = %e,
                "Dead-letter publish failed"
            ),
        }
        result.map_err(Error::from)
    }

    async fn write(&self, ctx: &Context, envelope: &Envelope) -> std::result::Result<(), BrokerError> {
        let partitions = self.writer.partitions(ctx, &self.topic).await?;
        let partition = partition_for_key(envelope.key.as_bytes(), partitions);
        self.writer
            .write(ctx, &self.topic, vec![envelope.to_outbound(partition)])
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.writer.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("topic", &self.topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_broker::MemoryBroker;
    use busline_core::WriterOptions;

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new("order-1", br#"{"a":1}"#.to_vec());
        envelope.topic = Some("orders".into());
        envelope.partition = Some(0);
        envelope.offset = Some(7);
        envelope.set_header(headers::EVENT_ID, "evt-1");
        envelope
    }

    fn router(broker: &MemoryBroker) -> DeadLetterRouter {
        DeadLetterRouter::new(
            Arc::new(broker.writer(WriterOptions::default())),
            "orders.dlq",
        )
    }

    #[test]
    fn annotate_adds_dlq_headers() {
        let broker = MemoryBroker::new();
        let failure = Failure::new("schema mismatch").with_consumer_group("billing");
        let copy = router(&broker).annotate(&envelope(), &failure);

        assert_eq!(copy.header(headers::ORIGINAL_TOPIC), Some("orders"));
        assert_eq!(copy.header(headers::DLQ_ERROR), Some("schema mismatch"));
        assert_eq!(copy.header(headers::DLQ_CONSUMER_GROUP), Some("billing"));
        assert!(copy.header(headers::DLQ_TIMESTAMP).is_some());
        assert_eq!(copy.event_id(), Some("evt-1"));
        assert_eq!(copy.key, "order-1");
        assert_eq!(copy.topic.as_deref(), Some("orders.dlq"));
        assert_eq!(copy.offset, None);
    }

    #[test]
    fn producer_failures_have_no_group() {
        let broker = MemoryBroker::new();
        let copy = router(&broker).annotate(&envelope(), &Failure::new("boom"));
        assert_eq!(copy.header(headers::DLQ_CONSUMER_GROUP), None);
    }

    #[tokio::test]
    async fn route_writes_to_dead_letter_topic() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(BusMetrics::new());
        let router = router(&broker).with_metrics(metrics.clone());

        router
            .route(&Context::new(), &envelope(), &Failure::new("invalid payload"))
            .await
            .unwrap();

        let records = broker.records("orders.dlq");
        assert_eq!(records.len(), 1);
        let stored = Envelope::from_record(records[0].clone());
        assert_eq!(stored.header(headers::ORIGINAL_TOPIC), Some("orders"));
        assert_eq!(stored.payload, br#"{"a":1}"#);
        assert_eq!(metrics.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn route_reports_write_failure() {
        let broker = MemoryBroker::new();
        broker.fail_writes(BrokerError::UnknownTopic("orders.dlq".into()), 1);
        let metrics = Arc::new(BusMetrics::new());
        let router = router(&broker).with_metrics(metrics.clone());

        let err = router
            .route(&Context::new(), &envelope(), &Failure::new("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broker(BrokerError::UnknownTopic(_))));
        assert_eq!(metrics.snapshot().dead_letter_failures, 1);
        assert_eq!(broker.record_count("orders.dlq"), 0);
    }

    #[tokio::test]
    async fn close_is_repeatable() {
        let broker = MemoryBroker::new();
        let router = router(&broker);
        router.close().await.unwrap();
        router.close().await.unwrap();
    }
}
