//! Writer half of the in-memory broker.

use async_trait::async_trait;
use busline_core::{
    BrokerError, BrokerWriter, Context, ErrorKind, OutboundRecord, Record, WriterOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::memory::{Shared, context_error};

/// Appends records to the shared partition logs.
///
/// Transient failures are retried inside a single `write` up to
/// `max_attempts`, the way a network driver would.
pub struct MemoryWriter {
    shared: Arc<Shared>,
    options: WriterOptions,
    closed: AtomicBool,
}

impl MemoryWriter {
    pub(crate) fn new(shared: Arc<Shared>, options: WriterOptions) -> Self {
        Self {
            shared,
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self, ctx: &Context) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        match ctx.err() {
            Some(err) => Err(context_error(err)),
            None => Ok(()),
        }
    }

    /// One attempt: all records are appended or none are.
    fn try_write(&self, topic: &str, records: &[OutboundRecord]) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if let Some(fault) = state.write_faults.pop_front() {
            return Err(fault);
        }

        let limit = state.max_message_bytes;
        if let Some(oversized) = records.iter().find(|r| r.value.len() > limit) {
            return Err(BrokerError::MessageTooLarge {
                size: oversized.value.len(),
                limit,
            });
        }

        let logs = state.topic_mut(topic)?;
        if let Some(bad) = records
            .iter()
            .find(|r| r.partition < 0 || r.partition as usize >= logs.len())
        {
            return Err(BrokerError::UnknownTopic(format!("{topic}/{}", bad.partition)));
        }

        for record in records {
            let log = &mut logs[record.partition as usize];
            let offset = log.len() as i64;
            log.push(Record {
                topic: topic.to_string(),
                partition: record.partition,
                offset,
                key: record.key.clone(),
                value: record.value.clone(),
                headers: record.headers.clone(),
                timestamp: record.timestamp,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerWriter for MemoryWriter {
    async fn partitions(&self, ctx: &Context, topic: &str) -> Result<u32, BrokerError> {
        self.check_open(ctx)?;
        let mut state = self.shared.lock();
        Ok(state.topic_mut(topic)?.len() as u32)
    }

    async fn write(
        &self,
        ctx: &Context,
        topic: &str,
        records: Vec<OutboundRecord>,
    ) -> Result<(), BrokerError> {
        self.check_open(ctx)?;
        self.shared.lock().write_calls += 1;

        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_write(topic, &records) {
                Ok(()) => {
                    self.shared.appended.notify_waiters();
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Transient && attempt < max_attempts => {
                    tracing::debug!(topic = %topic, attempt, error = %err, "Write attempt failed, retrying");
                    attempt += 1;
                    self.check_open(ctx)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;
    use chrono::Utc;

    fn outbound(partition: i32, key: &str, value: &str) -> OutboundRecord {
        OutboundRecord {
            partition,
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            headers: vec![("event-type".into(), b"test".to_vec())],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_appends_with_offsets() {
        let broker = MemoryBroker::new();
        let writer = broker.writer(WriterOptions::default());
        let ctx = Context::new();

        writer
            .write(&ctx, "orders", vec![outbound(0, "a", "1"), outbound(0, "b", "2")])
            .await
            .unwrap();

        let records = broker.records("orders");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].offset, 1);
        assert_eq!(records[1].key, b"b");
        assert_eq!(broker.write_calls(), 1);
    }

    #[tokio::test]
    async fn transient_faults_are_retried_within_max_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_writes(BrokerError::Unavailable("localhost:9092".into()), 2);
        let writer = broker.writer(WriterOptions::default());

        writer
            .write(&Context::new(), "orders", vec![outbound(0, "a", "1")])
            .await
            .unwrap();
        assert_eq!(broker.record_count("orders"), 1);
        assert_eq!(broker.write_calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_the_fault() {
        let broker = MemoryBroker::new();
        broker.fail_writes(BrokerError::Timeout("produce".into()), 5);
        let writer = broker.writer(WriterOptions {
            max_attempts: 2,
            ..WriterOptions::default()
        });

        let err = writer
            .write(&Context::new(), "orders", vec![outbound(0, "a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
        assert_eq!(broker.record_count("orders"), 0);
    }

    #[tokio::test]
    async fn permanent_fault_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.fail_writes(BrokerError::UnknownTopic("orders".into()), 1);
        broker.fail_writes(BrokerError::Unavailable("x".into()), 1);
        let writer = broker.writer(WriterOptions::default());

        let err = writer
            .write(&Context::new(), "orders", vec![outbound(0, "a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_whole() {
        let broker = MemoryBroker::new().with_max_message_bytes(4);
        let writer = broker.writer(WriterOptions::default());

        let err = writer
            .write(
                &Context::new(),
                "orders",
                vec![outbound(0, "a", "ok"), outbound(0, "b", "too large")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MessageTooLarge { size: 9, limit: 4 }));
        assert_eq!(broker.record_count("orders"), 0);
    }

    #[tokio::test]
    async fn out_of_range_partition_is_rejected() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 2);
        let writer = broker.writer(WriterOptions::default());
        let err = writer
            .write(&Context::new(), "orders", vec![outbound(2, "a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn partitions_reports_topic_size() {
        let broker = MemoryBroker::new().with_partitions(6);
        let writer = broker.writer(WriterOptions::default());
        assert_eq!(writer.partitions(&Context::new(), "events").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn closed_writer_refuses_writes() {
        let broker = MemoryBroker::new();
        let writer = broker.writer(WriterOptions::default());
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());

        let err = writer
            .write(&Context::new(), "orders", vec![outbound(0, "a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
        assert_eq!(broker.write_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_fails_write() {
        let broker = MemoryBroker::new();
        let writer = broker.writer(WriterOptions::default());
        let ctx = Context::new();
        ctx.cancel();
        assert!(
            writer
                .write(&ctx, "orders", vec![outbound(0, "a", "1")])
                .await
                .is_err()
        );
        assert_eq!(broker.record_count("orders"), 0);
    }
}
