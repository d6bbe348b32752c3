//! Logging interceptor: one structured line per envelope.

use async_trait::async_trait;
use busline_core::{Context, Envelope, Interceptor, Next, Result, headers};
use busline_telemetry::Stage;
use std::time::Instant;

/// Logs entry at `debug`, success at `info` and failure at `warn`, with the
/// envelope's identifiers and the time spent in the rest of the chain.
pub struct LoggingInterceptor {
    stage: Stage,
}

impl LoggingInterceptor {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        match self.stage {
            Stage::Publish => "logging.publish",
            Stage::Consume => "logging.consume",
        }
    }

    async fn intercept(&self, ctx: &Context, envelope: &Envelope, next: Next<'_>) -> Result<()> {
        let topic = envelope.topic.as_deref().unwrap_or("-");
        let event_id = envelope.event_id().unwrap_or("-");
        let retry_count = envelope.header(headers::RETRY_COUNT).unwrap_or("0");

        tracing::debug!(
            stage = %self.stage,
            topic = %topic,
            key = %envelope.key,
            event_id = %event_id,
            retry_count = %retry_count,
            "Envelope entering pipeline"
        );

        let started = Instant::now();
        let result = next.run(ctx, envelope).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => tracing::info!(
                stage = %self.stage,
                topic = %topic,
                key = %envelope.key,
                event_id = %event_id,
                duration_ms,
                "Envelope done"
            ),
            Err(e) => tracing::warn!(
                stage = %self.stage,
                topic = %topic,
                key = %envelope.key,
                event_id = %event_id,
                retry_count = %retry_count,
                duration_ms,
                error = %e,
                "Envelope failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::{ClassifiedError, Error, Pipeline, handler_fn};
    use std::sync::Arc;

    #[tokio::test]
    async fn passes_results_through() {
        let pipeline = Pipeline::new(vec![Arc::new(LoggingInterceptor::new(Stage::Consume))]);
        let envelope = Envelope::new("k", b"v".to_vec());

        let ok = handler_fn(|_ctx, _env| async { Ok(()) });
        assert!(pipeline.execute(&Context::new(), &envelope, &ok).await.is_ok());

        let failing = handler_fn(|_ctx, _env| async {
            Err(Error::Handler(ClassifiedError::permanent("bad payload")))
        });
        let err = pipeline
            .execute(&Context::new(), &envelope, &failing)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad payload");
    }

    #[test]
    fn name_reflects_stage() {
        assert_eq!(LoggingInterceptor::new(Stage::Publish).name(), "logging.publish");
        assert_eq!(LoggingInterceptor::new(Stage::Consume).name(), "logging.consume");
    }
}
