//! `busline simulate`: run a producer and a consumer against the in-memory
//! broker with a scripted failure pattern, then report what happened.

use busline_broker::MemoryBroker;
use busline_config::BusConfig;
use busline_core::{
    ClassifiedError, Context, Envelope, EnvelopeBuilder, Error, StartOffset, handler_fn, headers,
};
use busline_client::{consumer_from_config, producer_from_config};
use busline_telemetry::BusMetrics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How a failing message fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FailureMode {
    Transient,
    Permanent,
    Business,
}

#[derive(Debug, Clone, clap::Args)]
pub struct SimulateArgs {
    /// Config file (defaults to ~/.busline/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of messages to publish
    #[arg(short, long, default_value_t = 20)]
    pub messages: u64,

    /// Number of distinct partition keys
    #[arg(short, long, default_value_t = 4)]
    pub keys: u64,

    /// Partitions per topic
    #[arg(short, long, default_value_t = 3)]
    pub partitions: u32,

    /// Every n-th message fails (0 = none)
    #[arg(long, default_value_t = 5)]
    pub fail_every: u64,

    /// How failing messages fail
    #[arg(long, value_enum, default_value_t = FailureMode::Transient)]
    pub failure: FailureMode,

    /// Transient failures succeed once this many retries have happened
    #[arg(long)]
    pub recover_after: Option<u32>,

    /// Retry immediately instead of backing off
    #[arg(long)]
    pub no_backoff: bool,

    /// Give up waiting for the consumer after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Print the metrics snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Tick {
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct FailurePattern {
    every: u64,
    mode: FailureMode,
    recover_after: Option<u32>,
}

async fn handle_tick(envelope: Envelope, pattern: FailurePattern) -> Result<(), Error> {
    let tick: Tick = envelope.decode_json()?;
    if pattern.every == 0 || tick.seq % pattern.every != 0 {
        return Ok(());
    }

    let message = format!("simulated failure for seq {}", tick.seq);
    let err = match pattern.mode {
        FailureMode::Transient => match pattern.recover_after {
            Some(after) if envelope.retry_count() >= after => return Ok(()),
            _ => ClassifiedError::transient(message),
        },
        FailureMode::Permanent => ClassifiedError::permanent(message),
        FailureMode::Business => ClassifiedError::business(message),
    };
    Err(Error::Handler(err))
}

pub async fn run(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BusConfig::load_with_env(path)?,
        None => BusConfig::load()?,
    };
    // Everything is published before the consumer joins.
    config.consumer.start_offset = StartOffset::Oldest;
    config.consumer.topic = config.producer.topic.clone();
    if args.no_backoff {
        config.consumer.retry_backoff_ms = 0;
    }
    let dlq_topic = config
        .consumer
        .dead_letter_topic
        .clone()
        .unwrap_or_else(|| format!("{}.dlq", config.consumer.topic));
    config.consumer.dead_letter_topic = Some(dlq_topic.clone());
    config.validate()?;

    let broker = MemoryBroker::new().with_partitions(args.partitions);
    let metrics = Arc::new(BusMetrics::new());
    let ctx = Context::new();

    println!(
        "🚌 Simulating {} messages over {} keys on '{}' ({} partitions)",
        args.messages, args.keys, config.producer.topic, args.partitions
    );

    // ── Produce ───────────────────────────────────────────────────────
    let producer = producer_from_config(
        &config,
        Arc::new(broker.writer(config.writer_options())),
        Some(Arc::new(broker.writer(config.writer_options()))),
        &metrics,
    );
    for seq in 0..args.messages {
        let envelope = EnvelopeBuilder::new()
            .key(format!("key-{}", seq % args.keys.max(1)))
            .json_payload(&Tick { seq })
            .event_type("simulate.tick")
            .source("busline-simulate")
            .build()?;
        producer.publish(&ctx, envelope).await?;
    }
    producer.close().await?;

    // ── Consume ───────────────────────────────────────────────────────
    let pattern = FailurePattern {
        every: args.fail_every,
        mode: args.failure,
        recover_after: args.recover_after,
    };
    let handler = handler_fn(move |_ctx, envelope| handle_tick(envelope, pattern));

    let consumer = Arc::new(consumer_from_config(
        &config,
        Arc::new(broker.reader(config.reader_options())),
        Arc::new(handler),
        Some(Arc::new(broker.writer(config.writer_options()))),
        &metrics,
    ));

    let running = {
        let consumer = consumer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { consumer.start(&ctx).await })
    };

    let settled = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        loop {
            let snapshot = metrics.snapshot();
            if snapshot.commits + snapshot.commit_failures >= args.messages || running.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::warn!(timeout_secs = args.timeout_secs, "Consumer did not finish in time");
    }

    consumer.close().await?;
    match running.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => println!("   ⚠️  Consumer loop ended with: {e}"),
        Err(e) => return Err(e.into()),
    }

    // ── Report ────────────────────────────────────────────────────────
    let snapshot = metrics.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!("📊 Metrics");
        println!("─────────────────────────────────────");
        println!("  Published:       {}", snapshot.published);
        println!("  Handled:         {}", snapshot.handled);
        println!("  Handler errors:  {}", snapshot.handle_failures);
        println!("  Retries:         {}", snapshot.retries);
        println!("  Dead-lettered:   {}", snapshot.dead_lettered);
        println!("  Discarded:       {}", snapshot.discarded);
        println!("  Commits:         {}", snapshot.commits);
        println!("  Avg publish:     {:.3} ms", snapshot.avg_publish_ms);
        println!("  Avg handle:      {:.3} ms", snapshot.avg_handle_ms);
    }

    let dead_letters = broker.records(&dlq_topic);
    println!();
    println!("☠️  Dead-letter topic '{}': {} message(s)", dlq_topic, dead_letters.len());
    for record in dead_letters {
        let envelope = Envelope::from_record(record);
        println!(
            "  {:<8} retry-count={:<2} group={:<10} {}",
            envelope.key,
            envelope.header(headers::RETRY_COUNT).unwrap_or("0"),
            envelope.header(headers::DLQ_CONSUMER_GROUP).unwrap_or("-"),
            envelope.header(headers::DLQ_ERROR).unwrap_or("-"),
        );
    }

    Ok(())
}
