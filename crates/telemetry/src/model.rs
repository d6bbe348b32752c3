//! Data model for bus metrics snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Stage ─────────────────────────────────────────────────────────────────

/// Which side of the bus an interceptor is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The producer's publish path.
    Publish,
    /// The consumer's handle path.
    Consume,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish => write!(f, "publish"),
            Self::Consume => write!(f, "consume"),
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────

/// Per-topic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub published: u64,
    pub publish_failures: u64,
    pub handled: u64,
    pub handle_failures: u64,
    pub dead_lettered: u64,
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub handled: u64,
    pub handle_failures: u64,
    /// In-place retries of transient handler failures.
    pub retries: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    /// Business rejections dropped without dead-lettering.
    pub discarded: u64,
    pub commits: u64,
    pub commit_failures: u64,
    /// Mean publish latency through the pipeline, in milliseconds.
    pub avg_publish_ms: f64,
    /// Mean handler latency through the pipeline, in milliseconds.
    pub avg_handle_ms: f64,
    /// Counters broken down by topic name.
    pub topics: BTreeMap<String, TopicStats>,
    pub taken_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Failed handler invocations over all invocations, retries included,
    /// in `[0, 1]`.
    pub fn handle_failure_rate(&self) -> f64 {
        let total = self.handled + self.handle_failures;
        if total == 0 {
            0.0
        } else {
            self.handle_failures as f64 / total as f64
        }
    }
}
