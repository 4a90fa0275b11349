#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};

use imgfeed_core::config::{
    detected_cores, prefetch_workers, train_endpoint, DEFAULT_BENCH_BATCHES, DEFAULT_SEND_HWM,
    DEFAULT_WARMUP_BATCHES, WIRE_FORMAT,
};
use imgfeed_core::types::{AugPolicy, ImageBatch};
use imgfeed_flow::bench::{ThroughputReport, ThroughputSink};
use imgfeed_flow::dataset::{fake_batch, ImageFolder};
use imgfeed_flow::pipeline::{FlowCaps, FlowMetrics, FlowSource, Pipeline};
use imgfeed_flow::sink::Sink;
use imgfeed_wire::{encode_batch, ZmqSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AugArg {
    Fbresnet,
    Small,
}

impl From<AugArg> for AugPolicy {
    fn from(value: AugArg) -> Self {
        match value {
            AugArg::Fbresnet => AugPolicy::Fbresnet,
            AugArg::Small => AugPolicy::Small,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "imgfeed-serve")]
struct Args {
    /// ILSVRC12 dataset root (expects `train/<class>/<file>`).
    #[arg(long, env = "IMGFEED_DATA")]
    data: Option<PathBuf>,

    /// Serve a fixed synthetic batch instead of reading the dataset.
    #[arg(long, env = "IMGFEED_FAKE")]
    fake: bool,

    /// Augmentation policy.
    #[arg(long, env = "IMGFEED_AUG", value_enum, default_value_t = AugArg::Fbresnet)]
    aug: AugArg,

    /// Per-device batch size.
    #[arg(long, env = "IMGFEED_BATCH", default_value_t = 32)]
    batch: usize,

    /// Measure local throughput instead of sending batches.
    #[arg(long, env = "IMGFEED_BENCHMARK")]
    benchmark: bool,

    /// Send-side high-water mark (outstanding batches).
    #[arg(long, env = "IMGFEED_HWM", default_value_t = DEFAULT_SEND_HWM)]
    hwm: i32,

    /// Batches discarded before the benchmark starts timing.
    #[arg(long, env = "IMGFEED_WARMUP_BATCHES", default_value_t = DEFAULT_WARMUP_BATCHES)]
    warmup_batches: u64,

    /// Measured window of the benchmark.
    #[arg(long, env = "IMGFEED_BENCH_BATCHES", default_value_t = DEFAULT_BENCH_BATCHES)]
    bench_batches: u64,

    /// Override the min(50, cores) prefetch worker count.
    #[arg(long, env = "IMGFEED_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "IMGFEED_MAX_QUEUE_BATCHES", default_value_t = 64)]
    max_queue_batches: usize,

    #[arg(long, env = "IMGFEED_MAX_INFLIGHT_BYTES", default_value_t = 256 * 1024 * 1024)]
    max_inflight_bytes: u64,

    /// Override the derived `ipc://@imagenet-train-b<batch>` endpoint.
    #[arg(long, env = "IMGFEED_ENDPOINT")]
    endpoint: Option<String>,

    /// Shuffle / augmentation seed.
    #[arg(long, env = "IMGFEED_SEED", default_value_t = 0)]
    seed: u64,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "IMGFEED_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

/// The two terminal modes. Exactly one is constructed per process:
/// benchmark never touches the socket, serving never touches the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Stream { endpoint: String, hwm: i32 },
    Benchmark { warmup: u64, measure: u64 },
}

fn select_mode(args: &Args) -> Mode {
    if args.benchmark {
        Mode::Benchmark {
            warmup: args.warmup_batches,
            measure: args.bench_batches,
        }
    } else {
        Mode::Stream {
            endpoint: args
                .endpoint
                .clone()
                .unwrap_or_else(|| train_endpoint(args.batch)),
            hwm: args.hwm,
        }
    }
}

fn build_source(args: &Args) -> Result<FlowSource> {
    if args.fake {
        return Ok(FlowSource::Fake {
            template: fake_batch(args.batch, args.seed)?,
        });
    }
    let data = args
        .data
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("either --data or --fake is required"))?;
    Ok(FlowSource::Folder {
        dataset: Arc::new(ImageFolder::open(data)?),
        policy: args.aug.into(),
    })
}

/// Benchmark delivery path. Serving encodes every batch before it hits the
/// socket, so the measured window must include that cost; each batch is
/// encoded, the frame discarded, and the delivery counted.
struct EncodingBenchSink {
    counter: ThroughputSink,
    encoded_bytes: AtomicU64,
}

impl EncodingBenchSink {
    fn new(warmup: u64) -> Self {
        Self {
            counter: ThroughputSink::new(warmup),
            encoded_bytes: AtomicU64::new(0),
        }
    }

    fn report(&self) -> Option<ThroughputReport> {
        self.counter.report()
    }

    fn encoded_bytes(&self) -> u64 {
        self.encoded_bytes.load(Ordering::Relaxed)
    }
}

impl Sink for EncodingBenchSink {
    fn deliver(&self, batch: ImageBatch) -> Result<()> {
        let frame = encode_batch(&batch);
        self.encoded_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        drop(frame);
        self.counter.deliver(batch)
    }
}

fn emit_metrics_snapshot(metrics: &FlowMetrics) {
    let decode = metrics.decode_augment.snapshot();
    tracing::info!(
        target: "imgfeed_metrics",
        delivered_batches_total = metrics.delivered_batches_total.get(),
        delivered_samples_total = metrics.delivered_samples_total.get(),
        decode_failures_total = metrics.decode_failures_total.get(),
        epochs_total = metrics.epochs_total.get(),
        inflight_bytes = metrics.inflight_bytes.get(),
        inflight_bytes_high_water = metrics.inflight_bytes_high_water.get(),
        decode_augment_avg_us = decode.avg_ns() / 1000,
        decode_augment_max_us = decode.max_ns / 1000,
        "metrics"
    );
}

async fn run(args: Args, workers: usize) -> Result<()> {
    let caps = FlowCaps {
        batch_size: args.batch,
        workers,
        max_queue_batches: args.max_queue_batches,
        max_inflight_bytes: args.max_inflight_bytes,
        seed: args.seed,
    };
    let mode = select_mode(&args);
    let source = build_source(&args)?;

    let pipeline = Pipeline::new(caps)?;
    let metrics = pipeline.metrics();

    let snapshot_task = if args.metrics_snapshot_interval_ms > 0 {
        let interval_ms = args.metrics_snapshot_interval_ms.max(1);
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                emit_metrics_snapshot(&metrics);
            }
        }))
    } else {
        None
    };

    match mode {
        Mode::Benchmark { warmup, measure } => {
            let sink = Arc::new(EncodingBenchSink::new(warmup));
            info!(warmup, measure, "benchmark mode: no batches leave this process");
            pipeline
                .run(sink.clone(), source, Some(warmup.saturating_add(measure)))
                .await?;

            let report = sink
                .report()
                .ok_or_else(|| anyhow::anyhow!("benchmark ended before the measured window"))?;
            info!(
                measured_batches = report.measured_batches,
                measured_samples = report.measured_samples,
                encoded_bytes = sink.encoded_bytes(),
                elapsed_ms = (report.elapsed_secs * 1000.0) as u64,
                batches_per_sec = report.batches_per_sec,
                samples_per_sec = report.samples_per_sec,
                "benchmark complete"
            );
        }
        Mode::Stream { endpoint, hwm } => {
            let sink = Arc::new(ZmqSender::bind(&endpoint, hwm)?);
            info!(
                endpoint = %sink.endpoint(),
                format = WIRE_FORMAT,
                hwm = hwm,
                "serving batches"
            );
            tokio::select! {
                res = pipeline.run(sink, source, None) => {
                    res?;
                }
                _ = signal::ctrl_c() => {
                    warn!("ctrl-c received; exiting");
                }
            }
        }
    }

    if let Some(task) = snapshot_task {
        task.abort();
    }
    emit_metrics_snapshot(&metrics);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    imgfeed_observe::logging::init_tracing();
    let args = Args::parse();

    // This process is a CPU-side feeder for a GPU trainer; hide any GPUs
    // before pipeline threads exist.
    std::env::set_var("CUDA_VISIBLE_DEVICES", "");

    let workers = args
        .workers
        .unwrap_or_else(|| prefetch_workers(detected_cores()));

    let span = info_span!(
        "imgfeed-serve",
        batch = args.batch,
        aug = ?args.aug,
        fake = args.fake,
        benchmark = args.benchmark,
        workers = workers,
    );
    async move { run(args, workers).await }.instrument(span).await
}
