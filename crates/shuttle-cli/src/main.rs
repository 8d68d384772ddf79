use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use shuttle_core::config::LoggingConfig;
use shuttle_core::domain::{BatchId, HandlerError};
use shuttle_core::typed::{JobKind, TypedHandler, encode_payload};
use shuttle_core::{JobContext, NewJob, Priority, Shuttle, ShuttleConfig, handler_fn};

const QUEUE: &str = "demo";

#[derive(Debug, Parser)]
#[command(name = "shuttle", about = "Runs a batch of demo jobs through the shuttle queue")]
struct Args {
    /// TOML config file (SHUTTLE__* environment variables override it).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of jobs in the demo batch.
    #[arg(long, default_value_t = 20)]
    jobs: usize,

    /// Concurrent workers on the demo queue.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Every n-th resize job always fails (0 disables failures).
    #[arg(long, default_value_t = 4)]
    fail_every: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl JobKind for Greet {
    const TYPE: &'static str = "demo.greet.v1";
    type Output = String;
}

struct GreetHandler;

#[async_trait]
impl TypedHandler<Greet> for GreetHandler {
    async fn handle(&self, job: Greet, ctx: &JobContext) -> Result<String, HandlerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(job_id = %ctx.job_id, name = %job.name, "greeted");
        Ok(format!("Hello, {}!", job.name))
    }
}

/// Payload of the flaky resize job: one byte index, one failure flag.
fn resize_payload(index: usize, fail: bool) -> Vec<u8> {
    vec![u8::try_from(index % 256).unwrap_or(0), u8::from(fail)]
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

async fn wait_for_batch(shuttle: &Shuttle, batch_id: BatchId) -> Result<()> {
    let client = shuttle.client();
    loop {
        let view = client.get_batch(batch_id).await?;
        if view.done {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = tokio::signal::ctrl_c() => bail!("interrupted while waiting for batch {batch_id}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.jobs == 0 {
        bail!("--jobs must be at least 1");
    }

    let mut config = ShuttleConfig::load(args.config.as_deref()).context("load configuration")?;
    if args.config.is_none() {
        // keep the demo snappy when nothing was configured
        config.retry.base_delay_ms = config.retry.base_delay_ms.min(100);
    }
    init_tracing(&config.logging);

    let shuttle = Shuttle::builder().config(config).build()?;
    let registry = shuttle
        .registry_builder()
        .register_typed::<Greet, _>(GreetHandler)?
        .register(
            "demo.resize.v1",
            handler_fn(|ctx| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                match ctx.payload.as_slice() {
                    [_, 1] => Err(HandlerError::transient(format!(
                        "decoder busy (attempt {}/{})",
                        ctx.attempt, ctx.max_attempts
                    ))),
                    [index, _] => Ok(format!("thumb-{index}.png").into_bytes()),
                    _ => Err(HandlerError::permanent("malformed resize payload")),
                }
            }),
        )?
        .expect_types(&[Greet::TYPE, "demo.resize.v1"])
        .build()?;

    let pool = shuttle.pool(Arc::clone(&registry)).queue(QUEUE, args.workers).start()?;
    info!(workers = pool.worker_count(), queue = QUEUE, "demo pool running");
    let client = shuttle.client();

    // (A) 単発の typed job を最優先で投入し、続けて greet と resize を交互に詰めたバッチ
    let welcome = client
        .enqueue_typed(
            QUEUE,
            &Greet {
                name: "operator".into(),
            },
            Some(Priority::MAX),
        )
        .await?;
    println!("enqueued welcome job {welcome}");

    let mut jobs = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        let job = if i % 2 == 0 {
            let payload = encode_payload(&Greet {
                name: format!("guest-{i}"),
            })?;
            NewJob::new(Greet::TYPE, payload)
        } else {
            let fail = args.fail_every > 0 && i % args.fail_every == 1;
            NewJob::new("demo.resize.v1", resize_payload(i, fail))
        };
        jobs.push(job);
    }
    let (batch_id, job_ids) = client.enqueue_batch(QUEUE, jobs).await?;
    println!("enqueued batch {batch_id} with {} jobs", job_ids.len());

    // (B) バッチの完了をポーリングで待つ
    wait_for_batch(&shuttle, batch_id).await?;
    let view = client.get_batch(batch_id).await?;
    println!("batch: {}", serde_json::to_string_pretty(&view)?);

    // (C) metrics と dead letter
    println!("{}", shuttle.metrics().render_prometheus());
    let dead = client.list_dead_letters(QUEUE, 10).await?;
    for entry in &dead {
        println!(
            "dead letter {}: job {} ({}) after {} attempts: {}",
            entry.id, entry.job.id, entry.job.job_type, entry.job.attempts, entry.error
        );
    }

    // (D) dead letter を 1 件だけ再投入
    if let Some(entry) = dead.first() {
        let replayed = client.replay(entry.id).await?;
        println!("replayed {} as {replayed}", entry.id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = client.get_job(replayed).await?;
        println!("replayed job: {}", serde_json::to_string_pretty(&job)?);
    }

    // (E) graceful shutdown
    let report = pool.stop(Duration::from_secs(5)).await;
    if report.in_flight > 0 {
        warn!(in_flight = report.in_flight, "stopped with jobs still running");
    }
    println!(
        "pool stopped: drained={} detached={} in_flight={}",
        report.drained, report.detached, report.in_flight
    );
    Ok(())
}
