use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use imgfeed_core::types::{AugPolicy, ImageBatch, Sample, CROP_SIZE, SAMPLE_IMAGE_BYTES};
use imgfeed_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};

use crate::augment::{apply_chain, chain_for, Augmentor};
use crate::dataset::{ImageFolder, SampleRef};
use crate::decode::decode_image;
use crate::sink::Sink;

const PERMIT_UNIT_BYTES: u64 = 1024;

#[derive(Debug, Clone, Copy)]
pub struct FlowCaps {
    pub batch_size: usize,
    /// Concurrent batch builds; also the width of the decode pool.
    pub workers: usize,
    pub max_queue_batches: usize,
    pub max_inflight_bytes: u64,
    pub seed: u64,
}

#[derive(Debug, Default)]
pub struct FlowMetrics {
    pub delivered_batches_total: Counter,
    pub delivered_samples_total: Counter,
    pub decode_failures_total: Counter,
    pub epochs_total: Counter,
    pub inflight_bytes: Gauge,
    pub inflight_bytes_high_water: Gauge,
    pub decode_augment: DurationAgg,
}

impl FlowMetrics {
    fn on_inflight_add(&self, delta: u64) {
        let now = self.inflight_bytes.add(delta);
        self.inflight_bytes_high_water.max(now);
    }

    fn on_inflight_sub(&self, delta: u64) {
        self.inflight_bytes.sub(delta);
    }
}

/// A batch plus the inflight RAM permit backing it.
///
/// The permit is held until the lease is dropped, so a consumer holding
/// onto batches applies backpressure to the producers.
pub struct BatchLease {
    pub batch: ImageBatch,
    pub bytes: u64,
    metrics: Arc<FlowMetrics>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.metrics.on_inflight_sub(self.bytes);
    }
}

/// Where batches come from.
#[derive(Debug)]
pub enum FlowSource {
    /// Decode + augment + batch a directory-backed dataset, cycling epochs.
    Folder {
        dataset: Arc<ImageFolder>,
        policy: AugPolicy,
    },
    /// Serve a fixed template batch repeatedly.
    Fake { template: ImageBatch },
}

#[derive(Clone)]
pub struct Pipeline {
    caps: FlowCaps,
    metrics: Arc<FlowMetrics>,
    inflight_sem: Arc<Semaphore>,
    decode_pool: Arc<rayon::ThreadPool>,
}

/// Payload bytes one batch pins against the inflight budget.
pub fn batch_payload_bytes(batch_size: usize) -> u64 {
    (batch_size as u64) * ((SAMPLE_IMAGE_BYTES + std::mem::size_of::<i32>()) as u64)
}

impl Pipeline {
    pub fn new(caps: FlowCaps) -> Result<Self> {
        anyhow::ensure!(caps.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(caps.workers > 0, "workers must be > 0");
        anyhow::ensure!(
            batch_payload_bytes(caps.batch_size) <= caps.max_inflight_bytes,
            "one batch ({} bytes) exceeds max_inflight_bytes {}",
            batch_payload_bytes(caps.batch_size),
            caps.max_inflight_bytes
        );

        let max_units = caps.max_inflight_bytes.div_ceil(PERMIT_UNIT_BYTES).max(1);
        let max = usize::try_from(max_units).unwrap_or(usize::MAX);

        let decode_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(caps.workers)
            .thread_name(|i| format!("imgfeed-decode-{i}"))
            .build()?;

        Ok(Self {
            caps,
            metrics: Arc::new(FlowMetrics::default()),
            inflight_sem: Arc::new(Semaphore::new(max)),
            decode_pool: Arc::new(decode_pool),
        })
    }

    pub fn caps(&self) -> FlowCaps {
        self.caps
    }

    pub fn metrics(&self) -> Arc<FlowMetrics> {
        self.metrics.clone()
    }

    /// Drives `source` into `sink` until `limit` batches have been sent
    /// (forever when `limit` is `None`).
    pub async fn run<S: Sink>(
        &self,
        sink: Arc<S>,
        source: FlowSource,
        limit: Option<u64>,
    ) -> Result<()> {
        let (tx, sink_task) = self.spawn_sink(sink);
        let produced = match source {
            FlowSource::Fake { template } => self.produce_fake(tx, template, limit).await,
            FlowSource::Folder { dataset, policy } => {
                self.produce_folder(tx, dataset, policy, limit).await
            }
        };
        // A failing sink closes the channel, which the producer sees as a
        // send error; the sink's own error is the root cause.
        let delivered = sink_task
            .await
            .map_err(anyhow::Error::from)
            .and_then(|res| res);
        match (produced, delivered) {
            (Ok(()), Ok(())) => Ok(()),
            (_, Err(sink_err)) => Err(sink_err),
            (Err(produce_err), Ok(())) => Err(produce_err),
        }
    }

    fn spawn_sink<S: Sink>(
        &self,
        sink: Arc<S>,
    ) -> (
        mpsc::Sender<BatchLease>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, mut rx) = mpsc::channel::<BatchLease>(self.caps.max_queue_batches);
        let metrics = self.metrics.clone();

        let sink_task = tokio::spawn(async move {
            while let Some(lease) = rx.recv().await {
                let bytes = lease.bytes;
                let batch = lease.batch.clone();
                let sample_count = batch.batch_size() as u64;
                // Deliver on a blocking thread so a slow sink exerts
                // backpressure without stalling the tokio runtime.
                let sink = sink.clone();
                tokio::task::spawn_blocking(move || sink.deliver(batch))
                    .await
                    .map_err(anyhow::Error::from)??;

                metrics.delivered_batches_total.inc();
                metrics.delivered_samples_total.inc_by(sample_count);
                drop(lease);
                debug!(
                    target: "imgfeed_flow",
                    event = "delivered",
                    batch_bytes = bytes,
                    inflight_bytes = metrics.inflight_bytes.get(),
                    "delivered batch"
                );
            }
            Ok::<(), anyhow::Error>(())
        });

        (tx, sink_task)
    }

    async fn lease(&self, batch: ImageBatch) -> Result<BatchLease> {
        batch.validate()?;
        let bytes = batch.payload_bytes();
        let permit = acquire_permits(&self.inflight_sem, bytes).await?;
        self.metrics.on_inflight_add(bytes);
        Ok(BatchLease {
            batch,
            bytes,
            metrics: self.metrics.clone(),
            _permit: permit,
        })
    }

    async fn produce_fake(
        &self,
        tx: mpsc::Sender<BatchLease>,
        template: ImageBatch,
        limit: Option<u64>,
    ) -> Result<()> {
        template.validate()?;
        let mut sent: u64 = 0;
        loop {
            if let Some(limit) = limit {
                if sent >= limit {
                    return Ok(());
                }
            }
            let lease = self.lease(template.clone()).await?;
            tx.send(lease).await?;
            sent = sent.saturating_add(1);
        }
    }

    async fn produce_folder(
        &self,
        tx: mpsc::Sender<BatchLease>,
        dataset: Arc<ImageFolder>,
        policy: AugPolicy,
        limit: Option<u64>,
    ) -> Result<()> {
        let batch_size = self.caps.batch_size;
        anyhow::ensure!(
            dataset.len() >= batch_size,
            "dataset has {} samples, need at least one full batch of {}",
            dataset.len(),
            batch_size
        );

        let chain: Arc<Vec<Box<dyn Augmentor>>> = Arc::new(chain_for(policy));
        let workers = self.caps.workers;
        let batch_bytes = batch_payload_bytes(batch_size);
        let mut sent: u64 = 0;
        let mut epoch: u64 = 0;

        'serve: loop {
            let order = {
                let dataset = dataset.clone();
                let seed = self.caps.seed;
                tokio::task::spawn_blocking(move || dataset.epoch_order(seed, epoch))
                    .await
                    .map_err(anyhow::Error::from)?
            };
            // Remainder dropped: only full batches are served.
            let full_batches = (order.len() / batch_size) as u64;
            let order = Arc::new(order);
            self.metrics.epochs_total.inc();
            info!(
                target: "imgfeed_flow",
                event = "epoch_start",
                epoch = epoch,
                aug = policy.as_str(),
                batches = full_batches,
                dropped_samples = (order.len() % batch_size) as u64,
                "epoch start"
            );

            let epoch_seed = self
                .caps
                .seed
                .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15));

            let mut joinset: JoinSet<(u64, Result<BatchLease>)> = JoinSet::new();
            let mut buffer: BTreeMap<u64, BatchLease> = BTreeMap::new();
            let mut next_to_send: u64 = 0;
            let mut scheduled: u64 = 0;

            while next_to_send < full_batches {
                while let Some(lease) = buffer.remove(&next_to_send) {
                    tx.send(lease).await?;
                    next_to_send = next_to_send.saturating_add(1);
                    sent = sent.saturating_add(1);
                    if let Some(limit) = limit {
                        if sent >= limit {
                            break 'serve;
                        }
                    }
                }
                if next_to_send >= full_batches {
                    break;
                }

                // Permits are claimed here, in submission order, so a batch
                // parked in the reorder buffer can never hold budget that the
                // next batch in sequence still needs.
                if scheduled < full_batches && joinset.len() < workers {
                    tokio::select! {
                        permit = acquire_permits(&self.inflight_sem, batch_bytes) => {
                            let permit = permit?;
                            self.metrics.on_inflight_add(batch_bytes);

                            let batch_id = scheduled;
                            let start = (batch_id as usize) * batch_size;
                            let metrics = self.metrics.clone();
                            let pool = self.decode_pool.clone();
                            let chain = chain.clone();
                            let order = order.clone();
                            let seed = epoch_seed.wrapping_add(start as u64);

                            joinset.spawn(async move {
                                let lease = build_folder_lease(
                                    batch_size, metrics, permit, pool, chain, order, start, seed,
                                )
                                .await;
                                (batch_id, lease)
                            });
                            scheduled = scheduled.saturating_add(1);
                        }
                        Some(res) = joinset.join_next() => {
                            let (batch_id, lease) = res.map_err(anyhow::Error::from)?;
                            buffer.insert(batch_id, lease?);
                        }
                    }
                } else {
                    let Some(res) = joinset.join_next().await else {
                        break;
                    };
                    let (batch_id, lease) = res.map_err(anyhow::Error::from)?;
                    buffer.insert(batch_id, lease?);
                }
            }

            epoch = epoch.saturating_add(1);
        }

        Ok(())
    }
}

async fn acquire_permits(sem: &Arc<Semaphore>, bytes: u64) -> Result<OwnedSemaphorePermit> {
    let permit_units = if bytes == 0 {
        0u64
    } else {
        bytes.div_ceil(PERMIT_UNIT_BYTES).max(1)
    };
    anyhow::ensure!(
        permit_units <= u32::MAX as u64,
        "batch too large for permit accounting ({} units)",
        permit_units
    );
    let permit = sem
        .clone()
        .acquire_many_owned(permit_units as u32)
        .await?;
    Ok(permit)
}

// The caller already holds `permit` for this batch; it was acquired in
// submission order so decode work only starts once the RAM budget admits
// the payload.
#[allow(clippy::too_many_arguments)]
async fn build_folder_lease(
    batch_size: usize,
    metrics: Arc<FlowMetrics>,
    permit: OwnedSemaphorePermit,
    pool: Arc<rayon::ThreadPool>,
    chain: Arc<Vec<Box<dyn Augmentor>>>,
    order: Arc<Vec<SampleRef>>,
    start: usize,
    seed: u64,
) -> Result<BatchLease> {
    let bytes = batch_payload_bytes(batch_size);

    let built = {
        let metrics = metrics.clone();
        tokio::task::spawn_blocking(move || {
            pool.install(|| build_batch(&order[start..start + batch_size], &chain, seed, &metrics))
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r)
    };

    let batch = match built {
        Ok(batch) => batch,
        Err(err) => {
            metrics.on_inflight_sub(bytes);
            return Err(err);
        }
    };

    Ok(BatchLease {
        batch,
        bytes,
        metrics,
        _permit: permit,
    })
}

/// Decode + augment one chunk of sample refs into a full batch.
///
/// Samples that fail to decode are logged, counted, and backfilled from a
/// good sample of the same chunk so the batch shape contract holds.
fn build_batch(
    chunk: &[SampleRef],
    chain: &[Box<dyn Augmentor>],
    seed: u64,
    metrics: &FlowMetrics,
) -> Result<ImageBatch> {
    let decoded: Vec<Option<Sample>> = chunk
        .par_iter()
        .enumerate()
        .map(|(i, sref)| {
            let _timer = ScopedTimer::new(&metrics.decode_augment);
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let result = std::fs::read(&sref.path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| decode_image(&bytes))
                .and_then(|img| apply_chain(chain, img, &mut rng));
            match result {
                Ok(img) if img.dimensions() == (CROP_SIZE, CROP_SIZE) => Some(Sample {
                    pixels: img.into_raw(),
                    label: sref.label,
                }),
                Ok(img) => {
                    metrics.decode_failures_total.inc();
                    warn!(
                        path = %sref.path.display(),
                        width = img.width(),
                        height = img.height(),
                        "augmented sample has wrong shape; backfilling"
                    );
                    None
                }
                Err(err) => {
                    metrics.decode_failures_total.inc();
                    warn!(
                        path = %sref.path.display(),
                        error = %err,
                        "sample decode failed; backfilling"
                    );
                    None
                }
            }
        })
        .collect();

    let good: Vec<usize> = decoded
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.as_ref().map(|_| i))
        .collect();
    anyhow::ensure!(
        !good.is_empty(),
        "every sample in a batch of {} failed to decode",
        chunk.len()
    );

    let mut images = Vec::with_capacity(chunk.len() * SAMPLE_IMAGE_BYTES);
    let mut labels = Vec::with_capacity(chunk.len());
    for (i, slot) in decoded.iter().enumerate() {
        let sample = match slot {
            Some(s) => s,
            None => {
                let donor = good[i % good.len()];
                decoded[donor]
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("backfill donor missing"))?
            }
        };
        images.extend_from_slice(&sample.pixels);
        labels.push(sample.label);
    }

    Ok(ImageBatch::new(images, labels)?)
}
