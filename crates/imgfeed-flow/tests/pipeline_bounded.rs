use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use imgfeed_core::types::{AugPolicy, ImageBatch, SAMPLE_IMAGE_BYTES};
use imgfeed_flow::dataset::ImageFolder;
use imgfeed_flow::pipeline::{batch_payload_bytes, FlowCaps, FlowSource, Pipeline};
use imgfeed_flow::sink::Sink;

struct SlowSink {
    sleep: Duration,
    delivered_batches: AtomicU64,
    delivered_samples: AtomicU64,
}

impl SlowSink {
    fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            delivered_batches: AtomicU64::new(0),
            delivered_samples: AtomicU64::new(0),
        }
    }
}

impl Sink for SlowSink {
    fn deliver(&self, batch: ImageBatch) -> Result<()> {
        std::thread::sleep(self.sleep);
        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
        self.delivered_samples
            .fetch_add(batch.batch_size() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    labels: Mutex<Vec<Vec<i32>>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Vec<i32>> {
        self.labels
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }
}

impl Sink for RecordingSink {
    fn deliver(&self, batch: ImageBatch) -> Result<()> {
        batch.validate()?;
        let mut guard = self
            .labels
            .lock()
            .map_err(|_| anyhow::anyhow!("recording sink mutex poisoned"))?;
        guard.push(batch.labels.to_vec());
        Ok(())
    }
}

fn temp_dir(test_name: &str) -> Result<std::path::PathBuf> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut root = std::env::temp_dir();
    root.push(format!(
        "imgfeed-flow-{test_name}-{}-{stamp}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

/// Writes `files_per_class` small JPEGs under `<root>/train/<class>/`.
fn write_dataset(root: &Path, classes: &[&str], files_per_class: usize) -> Result<()> {
    for (ci, class) in classes.iter().enumerate() {
        let dir = root.join("train").join(class);
        std::fs::create_dir_all(&dir)?;
        for fi in 0..files_per_class {
            let img = image::RgbImage::from_fn(48, 32, |x, y| {
                image::Rgb([
                    ((x + ci as u32) % 256) as u8,
                    ((y + fi as u32) % 256) as u8,
                    ((x * y) % 256) as u8,
                ])
            });
            let mut encoded = Vec::new();
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, 85)
                .encode_image(&img)?;
            std::fs::write(dir.join(format!("{class}_{fi:04}.JPEG")), encoded)?;
        }
    }
    Ok(())
}

fn caps(batch_size: usize, max_inflight_bytes: u64) -> FlowCaps {
    FlowCaps {
        batch_size,
        workers: 4,
        max_queue_batches: 8,
        max_inflight_bytes,
        seed: 1234,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_sink_enforces_inflight_ram_cap() -> Result<()> {
    let root = temp_dir("ram-cap")?;
    write_dataset(&root, &["n01440764", "n01443537"], 16)?;

    let batch_size = 4;
    let cap_bytes = batch_payload_bytes(batch_size) * 2;
    let pipeline = Pipeline::new(caps(batch_size, cap_bytes))?;
    let metrics = pipeline.metrics();

    let dataset = Arc::new(ImageFolder::open(&root)?);
    let sink = Arc::new(SlowSink::new(Duration::from_millis(15)));
    pipeline
        .run(
            sink.clone(),
            FlowSource::Folder {
                dataset,
                policy: AugPolicy::Small,
            },
            Some(12),
        )
        .await?;

    assert_eq!(sink.delivered_batches.load(Ordering::Relaxed), 12);
    assert_eq!(
        sink.delivered_samples.load(Ordering::Relaxed),
        12 * batch_size as u64
    );

    let high_water = metrics.inflight_bytes_high_water.get();
    assert!(
        high_water <= cap_bytes,
        "inflight high-water {high_water} > cap {cap_bytes}"
    );

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_batch_budget_cannot_stall_ordered_delivery() -> Result<()> {
    let root = temp_dir("one-batch-budget")?;
    write_dataset(&root, &["cls_a", "cls_b"], 16)?;

    // The budget admits exactly one batch while eight builders compete for
    // it; out-of-order completions parked in the reorder buffer must never
    // pin the budget the next batch in sequence needs.
    let batch_size = 4;
    let caps = FlowCaps {
        batch_size,
        workers: 8,
        max_queue_batches: 8,
        max_inflight_bytes: batch_payload_bytes(batch_size),
        seed: 7,
    };

    for attempt in 0..3u32 {
        let pipeline = Pipeline::new(caps)?;
        let dataset = Arc::new(ImageFolder::open(&root)?);
        let sink = Arc::new(RecordingSink::default());
        let run = pipeline.run(
            sink.clone(),
            FlowSource::Folder {
                dataset,
                policy: AugPolicy::Small,
            },
            Some(8),
        );
        tokio::time::timeout(Duration::from_secs(30), run)
            .await
            .unwrap_or_else(|_| panic!("run stalled on attempt {attempt}"))?;
        assert_eq!(sink.take().len(), 8);
    }

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_final_batch_is_dropped() -> Result<()> {
    let root = temp_dir("drop-remainder")?;
    // 10 samples, batch 4: exactly 2 full batches per epoch.
    write_dataset(&root, &["cls_a", "cls_b"], 5)?;

    let batch_size = 4;
    let pipeline = Pipeline::new(caps(batch_size, 64 * 1024 * 1024))?;
    let metrics = pipeline.metrics();

    let dataset = Arc::new(ImageFolder::open(&root)?);
    let sink = Arc::new(RecordingSink::default());
    pipeline
        .run(
            sink.clone(),
            FlowSource::Folder {
                dataset,
                policy: AugPolicy::Fbresnet,
            },
            Some(2),
        )
        .await?;

    let batches = sink.take();
    assert_eq!(batches.len(), 2);
    for labels in &batches {
        assert_eq!(labels.len(), batch_size);
        assert!(labels.iter().all(|&l| l == 0 || l == 1));
    }
    assert_eq!(metrics.delivered_samples_total.get(), 8);
    assert_eq!(metrics.decode_failures_total.get(), 0);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefetch_delivery_is_deterministic_for_a_seed() -> Result<()> {
    let root = temp_dir("prefetch-order")?;
    write_dataset(&root, &["cls_a", "cls_b", "cls_c"], 8)?;

    let run_once = || async {
        let pipeline = Pipeline::new(caps(4, 64 * 1024 * 1024))?;
        let dataset = Arc::new(ImageFolder::open(&root)?);
        let sink = Arc::new(RecordingSink::default());
        pipeline
            .run(
                sink.clone(),
                FlowSource::Folder {
                    dataset,
                    policy: AugPolicy::Small,
                },
                Some(6),
            )
            .await?;
        Ok::<Vec<Vec<i32>>, anyhow::Error>(sink.take())
    };

    let first = run_once().await?;
    let second = run_once().await?;
    assert_eq!(first.len(), 6);
    // Concurrent batch builds finish out of order; the reorder buffer must
    // still deliver the seeded epoch sequence every time.
    assert_eq!(first, second);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_files_are_backfilled_not_fatal() -> Result<()> {
    let root = temp_dir("corrupt")?;
    write_dataset(&root, &["cls_a"], 6)?;
    // Two files of garbage alongside the good ones.
    std::fs::write(root.join("train/cls_a/zz_bad_0.JPEG"), [0u8; 64])?;
    std::fs::write(root.join("train/cls_a/zz_bad_1.JPEG"), [1u8; 64])?;

    let batch_size = 4;
    let pipeline = Pipeline::new(caps(batch_size, 64 * 1024 * 1024))?;
    let metrics = pipeline.metrics();

    let dataset = Arc::new(ImageFolder::open(&root)?);
    let sink = Arc::new(RecordingSink::default());
    pipeline
        .run(
            sink.clone(),
            FlowSource::Folder {
                dataset,
                policy: AugPolicy::Small,
            },
            Some(2),
        )
        .await?;

    let batches = sink.take();
    assert_eq!(batches.len(), 2);
    for labels in &batches {
        assert_eq!(labels.len(), batch_size);
    }
    assert_eq!(metrics.decode_failures_total.get(), 2);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn folder_labels_follow_sorted_class_dirs() -> Result<()> {
    let root = temp_dir("labels")?;
    write_dataset(&root, &["n02084071", "n01440764", "n03000134"], 2)?;

    let dataset = ImageFolder::open(&root)?;
    assert_eq!(
        dataset.classes(),
        ["n01440764", "n02084071", "n03000134"]
    );
    assert_eq!(dataset.len(), 6);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn missing_dataset_dir_is_an_error() {
    let err = ImageFolder::open("/definitely/not/a/dataset").unwrap_err();
    assert!(err.to_string().contains("read dataset dir failed"));
}
