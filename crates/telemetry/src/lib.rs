//! Delivery metrics for Busline.
//!
//! Counts publishes, handler invocations, retries, dead-letter writes and
//! commits, with a per-topic breakdown and mean latencies. Producers and
//! consumers record into a shared [`BusMetrics`]; [`MetricsInterceptor`]
//! plugs the same counters into any pipeline.

pub mod interceptor;
pub mod metrics;
pub mod model;

pub use interceptor::MetricsInterceptor;
pub use metrics::BusMetrics;
pub use model::{MetricsSnapshot, Stage, TopicStats};
