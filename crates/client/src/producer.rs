//! Producer: validates, pipelines and writes envelopes to one topic.

use async_trait::async_trait;
use busline_core::{
    BrokerError, BrokerWriter, Context, Envelope, Error, Handler, Interceptor, Pipeline, Result,
    partition_for_key,
};
use busline_telemetry::BusMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::dead_letter::{DeadLetterRouter, Failure};

/// Budget for dead-letter writes. The caller's context is often the reason
/// the write failed, so the copy gets its own.
const DEAD_LETTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes envelopes to a single topic.
///
/// Safe to share across tasks: the closed flag is atomic and the
/// interceptor list sits behind a lock, snapshotted once per publish.
pub struct Producer {
    writer: Arc<dyn BrokerWriter>,
    topic: String,
    dead_letter: Option<DeadLetterRouter>,
    pipeline: RwLock<Pipeline>,
    metrics: Option<Arc<BusMetrics>>,
    closed: AtomicBool,
}

impl Producer {
    pub fn new(writer: Arc<dyn BrokerWriter>, topic: impl Into<String>) -> Self {
        Self {
            writer,
            topic: topic.into(),
            dead_letter: None,
            pipeline: RwLock::new(Pipeline::default()),
            metrics: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Copy envelopes whose write fails to a dead-letter topic.
    pub fn with_dead_letter(mut self, router: DeadLetterRouter) -> Self {
        self.dead_letter = Some(router);
        self
    }

    pub fn with_interceptor(self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.add_interceptor(interceptor);
        self
    }

    /// Count batch publishes, which bypass the interceptors.
    pub fn with_metrics(mut self, metrics: Arc<BusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register an interceptor innermost of those already registered.
    /// Publishes already in flight keep the pipeline they started with.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        let mut pipeline = self.pipeline.write().unwrap_or_else(PoisonError::into_inner);
        *pipeline = pipeline.with(interceptor);
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish one envelope.
    ///
    /// The partition is chosen by hashing the key, so envelopes sharing a
    /// key keep their publish order. A failed broker write is copied to the
    /// dead-letter topic (when configured) and still returned to the caller.
    pub async fn publish(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ProducerClosed);
        }
        envelope.validate()?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut envelope = envelope;
        envelope.topic = Some(self.topic.clone());

        let partitions = match self.writer.partitions(ctx, &self.topic).await {
            Ok(partitions) => partitions,
            Err(e) => return self.fail(&envelope, Error::Broker(e)).await,
        };
        let partition = partition_for_key(envelope.key.as_bytes(), partitions);
        envelope.partition = Some(partition);

        let terminal = BrokerWrite {
            writer: self.writer.as_ref(),
            topic: &self.topic,
            partition,
        };
        match self.pipeline().execute(ctx, &envelope, &terminal).await {
            Ok(()) => {
                tracing::debug!(
                    topic = %self.topic,
                    partition,
                    key = %envelope.key,
                    "Envelope published"
                );
                Ok(())
            }
            Err(err @ Error::Broker(_)) => self.fail(&envelope, err).await,
            Err(err) => Err(err),
        }
    }

    /// Publish several envelopes in one broker write.
    ///
    /// Envelopes failing validation are dropped with a warning; the batch
    /// only fails validation as a whole when nothing survives. Interceptors
    /// are not run. Returns the number of envelopes written.
    pub async fn publish_batch(&self, ctx: &Context, envelopes: Vec<Envelope>) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ProducerClosed);
        }

        let submitted = envelopes.len();
        let mut batch: Vec<Envelope> = envelopes
            .into_iter()
            .filter(|envelope| match envelope.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        key = %envelope.key,
                        error = %e,
                        "Dropping invalid envelope from batch"
                    );
                    false
                }
            })
            .collect();

        if batch.is_empty() {
            return Err(Error::InvalidBatch(format!(
                "none of the {submitted} envelopes passed validation"
            )));
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        for envelope in &mut batch {
            envelope.topic = Some(self.topic.clone());
        }

        let result = self.write_batch(ctx, &mut batch).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(&self.topic, batch.len() as u64, result.is_ok(), None);
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    topic = %self.topic,
                    written = batch.len(),
                    dropped = submitted - batch.len(),
                    "Batch published"
                );
                Ok(batch.len())
            }
            Err(e) => self.fail_batch(&batch, Error::Broker(e)).await,
        }
    }

    async fn write_batch(
        &self,
        ctx: &Context,
        batch: &mut [Envelope],
    ) -> std::result::Result<(), BrokerError> {
        let partitions = self.writer.partitions(ctx, &self.topic).await?;
        let records = batch
            .iter_mut()
            .map(|envelope| {
                let partition = partition_for_key(envelope.key.as_bytes(), partitions);
                envelope.partition = Some(partition);
                envelope.to_outbound(partition)
            })
            .collect();
        self.writer.write(ctx, &self.topic, records).await
    }

    /// Copy a failed envelope to the dead-letter topic and build the error
    /// the caller sees.
    async fn fail(&self, envelope: &Envelope, err: Error) -> Result<()> {
        tracing::warn!(topic = %self.topic, key = %envelope.key, error = %err, "Publish failed");

        let Some(router) = &self.dead_letter else {
            return Err(err);
        };
        let ctx = Context::with_timeout(DEAD_LETTER_TIMEOUT);
        match router.route(&ctx, envelope, &Failure::new(&err)).await {
            Ok(()) => Err(err),
            Err(dead_letter) => Err(Error::DeadLetter {
                original: Box::new(err),
                dead_letter: Box::new(dead_letter),
            }),
        }
    }

    async fn fail_batch(&self, batch: &[Envelope], err: Error) -> Result<usize> {
        tracing::warn!(
            topic = %self.topic,
            size = batch.len(),
            error = %err,
            "Batch publish failed"
        );

        let Some(router) = &self.dead_letter else {
            return Err(err);
        };
        let failure = Failure::new(&err);
        let ctx = Context::with_timeout(DEAD_LETTER_TIMEOUT);
        let mut first_dead_letter_error = None;
        for envelope in batch {
            if let Err(e) = router.route(&ctx, envelope, &failure).await {
                first_dead_letter_error.get_or_insert(e);
            }
        }
        match first_dead_letter_error {
            None => Err(err),
            Some(dead_letter) => Err(Error::DeadLetter {
                original: Box::new(err),
                dead_letter: Box::new(dead_letter),
            }),
        }
    }

    /// Close the writer and the dead-letter writer. Later calls are no-ops,
    /// and every publish after the first call fails with
    /// [`Error::ProducerClosed`] without touching the broker.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(topic = %self.topic, "Closing producer");

        let writer = self.writer.close().await;
        let dead_letter = match &self.dead_letter {
            Some(router) => router.close().await,
            None => Ok(()),
        };
        writer?;
        dead_letter
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("dead_letter", &self.dead_letter)
            .field("pipeline", &self.pipeline())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Terminal link of the publish pipeline.
struct BrokerWrite<'a> {
    writer: &'a dyn BrokerWriter,
    topic: &'a str,
    partition: i32,
}

#[async_trait]
impl Handler for BrokerWrite<'_> {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<()> {
        self.writer
            .write(ctx, self.topic, vec![envelope.to_outbound(self.partition)])
            .await?;
        Ok(())
    }
}
