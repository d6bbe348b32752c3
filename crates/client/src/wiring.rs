//! Build producers and consumers from a [`BusConfig`].

use busline_config::{BusConfig, InterceptorConfig};
use busline_core::{BrokerReader, BrokerWriter, Handler, Interceptor};
use busline_telemetry::{BusMetrics, MetricsInterceptor, Stage};
use std::sync::Arc;

use crate::consumer::Consumer;
use crate::dead_letter::DeadLetterRouter;
use crate::logging::LoggingInterceptor;
use crate::producer::Producer;

/// The built-in interceptors enabled by `config`, outermost first:
/// logging, then metrics.
pub fn builtin_interceptors(
    config: &InterceptorConfig,
    stage: Stage,
    metrics: &Arc<BusMetrics>,
) -> Vec<Arc<dyn Interceptor>> {
    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
    if !config.enabled {
        return interceptors;
    }
    if config.logging {
        interceptors.push(Arc::new(LoggingInterceptor::new(stage)));
    }
    if config.metrics {
        interceptors.push(Arc::new(MetricsInterceptor::new(metrics.clone(), stage)));
    }
    interceptors
}

/// A producer for `config.producer.topic`.
///
/// `dead_letter_writer` is only used when a producer dead-letter topic is
/// configured.
pub fn producer_from_config(
    config: &BusConfig,
    writer: Arc<dyn BrokerWriter>,
    dead_letter_writer: Option<Arc<dyn BrokerWriter>>,
    metrics: &Arc<BusMetrics>,
) -> Producer {
    let mut producer = Producer::new(writer, config.producer.topic.clone()).with_metrics(metrics.clone());

    if let (Some(topic), Some(writer)) = (&config.producer.dead_letter_topic, dead_letter_writer) {
        producer = producer
            .with_dead_letter(DeadLetterRouter::new(writer, topic.clone()).with_metrics(metrics.clone()));
    }

    for interceptor in builtin_interceptors(&config.interceptors, Stage::Publish, metrics) {
        producer.add_interceptor(interceptor);
    }
    producer
}

/// A consumer for the reader's topic, configured from `config.consumer`.
pub fn consumer_from_config(
    config: &BusConfig,
    reader: Arc<dyn BrokerReader>,
    handler: Arc<dyn Handler>,
    dead_letter_writer: Option<Arc<dyn BrokerWriter>>,
    metrics: &Arc<BusMetrics>,
) -> Consumer {
    let mut consumer = Consumer::new(reader, handler)
        .with_config(&config.consumer)
        .with_metrics(metrics.clone());

    if let (Some(topic), Some(writer)) = (&config.consumer.dead_letter_topic, dead_letter_writer) {
        consumer = consumer
            .with_dead_letter(DeadLetterRouter::new(writer, topic.clone()).with_metrics(metrics.clone()));
    }

    for interceptor in builtin_interceptors(&config.interceptors, Stage::Consume, metrics) {
        consumer = consumer.with_interceptor(interceptor);
    }
    consumer
}
