//! Thread-safe metrics aggregator for producers and consumers.

use crate::model::{MetricsSnapshot, TopicStats};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Counters shared by every producer, consumer and interceptor that holds
/// the same `Arc<BusMetrics>`.
///
/// Global counters are lock-free; the per-topic breakdown sits behind a
/// `RwLock`.
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    publish_failures: AtomicU64,
    handled: AtomicU64,
    handle_failures: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    discarded: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    publish_micros: AtomicU64,
    publish_samples: AtomicU64,
    handle_micros: AtomicU64,
    handle_samples: AtomicU64,
    topics: RwLock<BTreeMap<String, TopicStats>>,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Publish side ──────────────────────────────────────────────────

    /// Record `count` envelopes written to `topic` (or failed to be).
    pub fn record_publish(&self, topic: &str, count: u64, success: bool, elapsed: Option<Duration>) {
        if success {
            self.published.fetch_add(count, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(count, Ordering::Relaxed);
        }
        if let Some(elapsed) = elapsed {
            self.publish_micros
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
            self.publish_samples.fetch_add(1, Ordering::Relaxed);
        }
        self.with_topic(topic, |stats| {
            if success {
                stats.published += count;
            } else {
                stats.publish_failures += count;
            }
        });
    }

    // ── Consume side ──────────────────────────────────────────────────

    /// Record one handler invocation on `topic`.
    pub fn record_handle(&self, topic: &str, success: bool, elapsed: Duration) {
        if success {
            self.handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.handle_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.handle_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.handle_samples.fetch_add(1, Ordering::Relaxed);
        self.with_topic(topic, |stats| {
            if success {
                stats.handled += 1;
            } else {
                stats.handle_failures += 1;
            }
        });
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead-letter write for an envelope that came from `topic`.
    pub fn record_dead_letter(&self, topic: &str, success: bool) {
        if success {
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            self.with_topic(topic, |stats| stats.dead_lettered += 1);
        } else {
            self.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, success: bool) {
        if success {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MetricsSnapshot {
        let topics = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            handle_failures: self.handle_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            avg_publish_ms: mean_ms(&self.publish_micros, &self.publish_samples),
            avg_handle_ms: mean_ms(&self.handle_micros, &self.handle_samples),
            topics,
            taken_at: Utc::now(),
        }
    }

    /// Stats for a single topic, if anything was recorded for it.
    pub fn topic(&self, topic: &str) -> Option<TopicStats> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    fn with_topic(&self, topic: &str, update: impl FnOnce(&mut TopicStats)) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        update(topics.entry(topic.to_string()).or_default());
    }
}

fn mean_ms(micros: &AtomicU64, samples: &AtomicU64) -> f64 {
    let samples = samples.load(Ordering::Relaxed);
    if samples == 0 {
        return 0.0;
    }
    micros.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
}
