//! Consumer: fetch, process with in-place retry, dead-letter, commit.
//!
//! One [`Consumer::start`] loop per consumer. Each record is processed to
//! completion before the next fetch: a transient handler failure is retried
//! in place up to the retry budget, which stalls the partition and is the
//! only backpressure there is. Terminal failures go to the dead-letter
//! topic and the offset is committed according to the [`CommitPolicy`].

use busline_config::{BusinessErrorPolicy, CommitPolicy, ConsumerConfig};
use busline_core::{
    BrokerReader, Context, Envelope, Error, ErrorKind, Handler, Interceptor, Pipeline, Record,
    Result, RetryPolicy, classify,
};
use busline_telemetry::BusMetrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::dead_letter::{DeadLetterRouter, Failure};

/// Pause after a failed fetch before trying again.
const DEFAULT_FETCH_BACKOFF: Duration = Duration::from_secs(1);

/// Budget for dead-letter writes and commits once a record has been
/// handled. These run on their own context so a shutdown that lands while
/// a handler is busy does not abandon the record half-settled.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, `start` not called yet.
    Idle,
    Running,
    /// `close` requested, waiting for the loop to exit.
    Draining,
    Closed,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How processing of a single envelope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler succeeded, possibly after in-place retries.
    Handled,
    /// A terminal failure was written to the dead-letter topic.
    DeadLettered,
    /// A terminal failure was dropped: a discarded business rejection, or
    /// no dead-letter topic configured.
    Discarded,
    /// A terminal failure could not be written to the dead-letter topic.
    DeadLetterFailed,
    /// The context ended or the consumer shut down before the envelope was
    /// settled. Nothing was dead-lettered; the record is left for
    /// redelivery.
    Interrupted,
}

pub struct Consumer {
    reader: Arc<dyn BrokerReader>,
    handler: Arc<dyn Handler>,
    dead_letter: Option<DeadLetterRouter>,
    pipeline: Pipeline,
    retry: RetryPolicy,
    commit_policy: CommitPolicy,
    business_errors: BusinessErrorPolicy,
    fetch_backoff: Duration,
    metrics: Option<Arc<BusMetrics>>,
    state: watch::Sender<ConsumerState>,
    shutdown: CancellationToken,
    released: AtomicBool,
}

impl Consumer {
    pub fn new(reader: Arc<dyn BrokerReader>, handler: Arc<dyn Handler>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            reader,
            handler,
            dead_letter: None,
            pipeline: Pipeline::default(),
            retry: RetryPolicy::default(),
            commit_policy: CommitPolicy::default(),
            business_errors: BusinessErrorPolicy::default(),
            fetch_backoff: DEFAULT_FETCH_BACKOFF,
            metrics: None,
            state,
            shutdown: CancellationToken::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Apply the retry, commit, business-error and fetch-backoff settings.
    pub fn with_config(self, config: &ConsumerConfig) -> Self {
        self.with_retry_policy(config.retry_policy())
            .with_commit_policy(config.commit_policy)
            .with_business_errors(config.business_errors)
            .with_fetch_backoff(config.fetch_backoff())
    }

    pub fn with_dead_letter(mut self, router: DeadLetterRouter) -> Self {
        self.dead_letter = Some(router);
        self
    }

    /// Register an interceptor innermost of those already registered.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.pipeline = self.pipeline.with(interceptor);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    pub fn with_business_errors(mut self, policy: BusinessErrorPolicy) -> Self {
        self.business_errors = policy;
        self
    }

    pub fn with_fetch_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_backoff = backoff;
        self
    }

    /// Count retries, discards and commits.
    pub fn with_metrics(mut self, metrics: Arc<BusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn topic(&self) -> &str {
        self.reader.topic()
    }

    pub fn group_id(&self) -> &str {
        self.reader.group_id()
    }

    // ── Fetch loop ────────────────────────────────────────────────────

    /// Run the fetch loop until `ctx` ends, [`close`](Self::close) is
    /// called, or the reader reports a fatal error.
    ///
    /// Returns `Ok(())` after a close, the context error after
    /// cancellation or deadline, and the broker error after a fatal fetch
    /// failure. The consumer is `Closed` afterwards and cannot be started
    /// again.
    pub async fn start(&self, ctx: &Context) -> Result<()> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Idle {
                *state = ConsumerState::Running;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        match refused {
            Some(ConsumerState::Running | ConsumerState::Draining) => {
                return Err(Error::ConsumerRunning);
            }
            Some(_) => return Err(Error::ConsumerClosed),
            None => {}
        }

        tracing::info!(
            topic = %self.reader.topic(),
            group = %self.reader.group_id(),
            max_retries = self.retry.max_retries,
            dead_letter = self.dead_letter.as_ref().map(|r| r.topic()).unwrap_or("-"),
            "Consumer started"
        );

        let result = self.run(ctx).await;
        self.state.send_replace(ConsumerState::Closed);

        match &result {
            Ok(()) => tracing::info!(topic = %self.reader.topic(), "Consumer stopped"),
            Err(e) => tracing::info!(topic = %self.reader.topic(), reason = %e, "Consumer stopped"),
        }
        result
    }

    async fn run(&self, ctx: &Context) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                err = ctx.done() => return Err(err),
                fetched = self.reader.fetch(ctx) => fetched,
            };

            let record = match fetched {
                Ok(record) => record,
                Err(e) if e.is_fatal() => {
                    tracing::error!(topic = %self.reader.topic(), error = %e, "Fatal fetch error");
                    return Err(Error::Broker(e));
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %self.reader.topic(),
                        error = %e,
                        backoff_ms = self.fetch_backoff.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = ctx.sleep(self.fetch_backoff) => {}
                    }
                    continue;
                }
            };

            let envelope = Envelope::from_record(record.clone());
            match self.settle(ctx, envelope).await {
                Ok(_) => {}
                Err(Error::ConsumerClosed) => {
                    tracing::info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Shutdown during retry backoff, leaving offset uncommitted"
                    );
                    return Ok(());
                }
                Err(e) if e.is_context() => {
                    tracing::info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        reason = %e,
                        "Processing interrupted, leaving offset uncommitted"
                    );
                    return Err(e);
                }
                Err(e) if self.commit_policy == CommitPolicy::AfterTerminalHandling => {
                    tracing::error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Leaving offset uncommitted after failed dead-letter write"
                    );
                    return Err(e);
                }
                Err(_) => {}
            }

            self.commit(&record).await;
        }
    }

    async fn commit(&self, record: &Record) {
        let ctx = Context::with_timeout(SETTLE_TIMEOUT);
        let result = self.reader.commit(&ctx, record).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_commit(result.is_ok());
        }
        match result {
            Ok(()) => tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Offset committed"
            ),
            Err(e) => tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed"
            ),
        }
    }

    // ── Processing ────────────────────────────────────────────────────

    /// Run one envelope through the pipeline and handler, retrying
    /// transient failures in place and dead-lettering terminal ones.
    pub async fn process_message(&self, ctx: &Context, envelope: Envelope) -> ProcessOutcome {
        match self.settle(ctx, envelope).await {
            Ok(outcome) => outcome,
            Err(Error::ConsumerClosed) => ProcessOutcome::Interrupted,
            Err(e) if e.is_context() => ProcessOutcome::Interrupted,
            Err(_) => ProcessOutcome::DeadLetterFailed,
        }
    }

    /// `Err` when a terminal failure could not be dead-lettered, with the
    /// context error when `ctx` ended mid-processing, and with
    /// [`Error::ConsumerClosed`] when a shutdown cut a retry backoff short.
    async fn settle(&self, ctx: &Context, mut envelope: Envelope) -> Result<ProcessOutcome> {
        let err = loop {
            let err = match self
                .pipeline
                .execute(ctx, &envelope, self.handler.as_ref())
                .await
            {
                Ok(()) => return Ok(ProcessOutcome::Handled),
                Err(err) => err,
            };

            // Not the message's fault: leave it for redelivery.
            if err.is_context() || ctx.is_done() {
                return Err(ctx.err().unwrap_or(err));
            }

            let attempt = envelope.retry_count();
            if !self.retry.should_retry(&err, attempt) {
                break err;
            }

            let retry_count = envelope.increment_retry_count();
            if let Some(metrics) = &self.metrics {
                metrics.record_retry();
            }
            let delay = self.retry.next_delay(retry_count);
            tracing::warn!(
                topic = %self.reader.topic(),
                key = %envelope.key,
                retry_count,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient handler failure, retrying in place"
            );
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::ConsumerClosed),
                    err = ctx.done() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        };

        let kind = classify(&err);
        if kind == ErrorKind::Business && self.business_errors == BusinessErrorPolicy::Discard {
            tracing::warn!(
                topic = %self.reader.topic(),
                key = %envelope.key,
                error = %err,
                "Business rejection discarded"
            );
            self.record_discard();
            return Ok(ProcessOutcome::Discarded);
        }

        tracing::warn!(
            topic = %self.reader.topic(),
            key = %envelope.key,
            kind = %kind,
            retry_count = envelope.retry_count(),
            error = %err,
            "Handler failed terminally"
        );
        self.dead_letter(&envelope, err).await
    }

    async fn dead_letter(&self, envelope: &Envelope, err: Error) -> Result<ProcessOutcome> {
        let Some(router) = &self.dead_letter else {
            tracing::error!(
                topic = %self.reader.topic(),
                key = %envelope.key,
                error = %err,
                "No dead-letter topic configured, dropping envelope"
            );
            self.record_discard();
            return Ok(ProcessOutcome::Discarded);
        };

        let failure = Failure::new(&err).with_consumer_group(self.reader.group_id());
        let ctx = Context::with_timeout(SETTLE_TIMEOUT);
        match router.route(&ctx, envelope, &failure).await {
            Ok(()) => Ok(ProcessOutcome::DeadLettered),
            Err(dead_letter) => Err(Error::DeadLetter {
                original: Box::new(err),
                dead_letter: Box::new(dead_letter),
            }),
        }
    }

    fn record_discard(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_discard();
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────

    /// Stop the loop, wait for it to exit, then close the reader and the
    /// dead-letter writer. Safe to call more than once and from another
    /// task than the one running [`start`](Self::start).
    ///
    /// A handler already running is not interrupted. A pending retry
    /// backoff is, and that record is left uncommitted.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let mut draining = false;
        self.state.send_if_modified(|state| match state {
            ConsumerState::Running => {
                *state = ConsumerState::Draining;
                draining = true;
                true
            }
            ConsumerState::Idle => {
                *state = ConsumerState::Closed;
                true
            }
            ConsumerState::Draining | ConsumerState::Closed => false,
        });

        let mut state = self.state.subscribe();
        if draining || *state.borrow() == ConsumerState::Draining {
            tracing::info!(topic = %self.reader.topic(), "Waiting for consumer loop to exit");
            let _ = state.wait_for(|s| *s == ConsumerState::Closed).await;
        }

        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let reader = self.reader.close().await;
        let dead_letter = match &self.dead_letter {
            Some(router) => router.close().await,
            None => Ok(()),
        };
        self.state.send_replace(ConsumerState::Closed);
        tracing::info!(topic = %self.reader.topic(), group = %self.reader.group_id(), "Consumer closed");

        reader?;
        dead_letter
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.reader.topic())
            .field("group_id", &self.reader.group_id())
            .field("state", &self.state())
            .field("pipeline", &self.pipeline)
            .field("retry", &self.retry)
            .field("commit_policy", &self.commit_policy)
            .field("business_errors", &self.business_errors)
            .finish()
    }
}
