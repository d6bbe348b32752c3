//! Interceptor that feeds [`BusMetrics`] from the publish or consume path.

use async_trait::async_trait;
use busline_core::{Context, Envelope, Interceptor, Next, Result};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::BusMetrics;
use crate::model::Stage;

const UNKNOWN_TOPIC: &str = "unknown";

/// Counts and times every envelope passing through a pipeline.
///
/// On the publish path register it on the producer with [`Stage::Publish`];
/// on the consume path, on the consumer with [`Stage::Consume`]. Each handler
/// invocation (including in-place retries) is one sample.
pub struct MetricsInterceptor {
    metrics: Arc<BusMetrics>,
    stage: Stage,
}

impl MetricsInterceptor {
    pub fn new(metrics: Arc<BusMetrics>, stage: Stage) -> Self {
        Self { metrics, stage }
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &str {
        match self.stage {
            Stage::Publish => "metrics.publish",
            Stage::Consume => "metrics.consume",
        }
    }

    async fn intercept(&self, ctx: &Context, envelope: &Envelope, next: Next<'_>) -> Result<()> {
        let started = Instant::now();
        let result = next.run(ctx, envelope).await;
        let elapsed = started.elapsed();
        let topic = envelope.topic.as_deref().unwrap_or(UNKNOWN_TOPIC);

        match self.stage {
            Stage::Publish => {
                self.metrics
                    .record_publish(topic, 1, result.is_ok(), Some(elapsed))
            }
            Stage::Consume => self.metrics.record_handle(topic, result.is_ok(), elapsed),
        }
        result
    }
}
