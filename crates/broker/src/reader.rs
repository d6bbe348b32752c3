//! Reader half of the in-memory broker.

use async_trait::async_trait;
use busline_core::{BrokerError, BrokerReader, Context, ReaderOptions, Record, StartOffset};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::memory::{BrokerState, Shared, context_error};

/// Reads one topic on behalf of one consumer group.
///
/// Partitions are polled round-robin. A partition the group has committed
/// to resumes at the committed offset; otherwise the reader starts where
/// [`StartOffset`] says. Every reader sees every partition: there is no
/// group rebalancing between readers.
pub struct MemoryReader {
    shared: Arc<Shared>,
    options: ReaderOptions,
    /// Next offset to hand out, per partition.
    positions: Mutex<HashMap<i32, i64>>,
    cursor: AtomicUsize,
    closed: CancellationToken,
}

impl MemoryReader {
    pub(crate) fn new(shared: Arc<Shared>, options: ReaderOptions) -> Self {
        let mut positions = HashMap::new();
        {
            let state = shared.lock();
            if let Some(logs) = state.topics.get(&options.topic) {
                for (index, log) in logs.iter().enumerate() {
                    let partition = index as i32;
                    let position = match state.committed(&options.group_id, &options.topic, partition) {
                        Some(committed) => committed,
                        None => match options.start_offset {
                            StartOffset::Newest => log.len() as i64,
                            StartOffset::Oldest => 0,
                            StartOffset::At(offset) => offset,
                        },
                    };
                    positions.insert(partition, position);
                }
            }
        }

        tracing::debug!(
            topic = %options.topic,
            group = %options.group_id,
            start = %options.start_offset,
            "Reader joined"
        );

        Self {
            shared,
            options,
            positions: Mutex::new(positions),
            cursor: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// Position for a partition that did not exist when the reader joined:
    /// everything in it was written afterwards.
    fn late_position(&self, state: &BrokerState, partition: i32) -> i64 {
        state
            .committed(&self.options.group_id, &self.options.topic, partition)
            .unwrap_or(match self.options.start_offset {
                StartOffset::At(offset) => offset,
                StartOffset::Newest | StartOffset::Oldest => 0,
            })
    }

    fn poll_next(&self) -> Result<Option<Record>, BrokerError> {
        let mut state = self.shared.lock();
        if let Some(fault) = state.fetch_faults.pop_front() {
            return Err(fault);
        }

        let Some(logs) = state.topics.get(&self.options.topic) else {
            return Ok(None);
        };
        let count = logs.len();
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let start = self.cursor.load(Ordering::Relaxed);

        for step in 0..count {
            let index = (start + step) % count;
            let partition = index as i32;
            let position = match positions.get(&partition) {
                Some(position) => *position,
                None => self.late_position(&state, partition),
            };

            let next = usize::try_from(position)
                .ok()
                .and_then(|offset| logs[index].get(offset));
            if let Some(record) = next {
                positions.insert(partition, position + 1);
                self.cursor.store((index + 1) % count, Ordering::Relaxed);
                return Ok(Some(record.clone()));
            }
            positions.insert(partition, position);
        }
        Ok(None)
    }
}

#[async_trait]
impl BrokerReader for MemoryReader {
    fn topic(&self) -> &str {
        &self.options.topic
    }

    fn group_id(&self) -> &str {
        &self.options.group_id
    }

    async fn fetch(&self, ctx: &Context) -> Result<Record, BrokerError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(BrokerError::Closed);
            }
            if let Some(err) = ctx.err() {
                return Err(context_error(err));
            }

            // Register for wake-ups before looking, so a write landing in
            // between is not missed.
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.poll_next()? {
                return Ok(record);
            }

            tokio::select! {
                _ = appended => {}
                _ = self.closed.cancelled() => return Err(BrokerError::Closed),
                err = ctx.done() => return Err(context_error(err)),
            }
        }
    }

    async fn commit(&self, ctx: &Context, record: &Record) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if let Some(err) = ctx.err() {
            return Err(context_error(err));
        }

        let mut state = self.shared.lock();
        if let Some(fault) = state.commit_faults.pop_front() {
            return Err(fault);
        }
        let next = record.offset + 1;
        let slot = state
            .committed
            .entry((
                self.options.group_id.clone(),
                record.topic.clone(),
                record.partition,
            ))
            .or_insert(next);
        *slot = (*slot).max(next);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        Ok(())
    }
}
