use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;

use imgfeed_core::types::ImageBatch;

use crate::sink::Sink;

/// Local throughput probe used by `--benchmark` instead of a socket.
///
/// The first `warmup` deliveries are discarded (decode pools and page
/// caches are cold); timing starts at the end of the warmup and covers
/// everything after it.
pub struct ThroughputSink {
    warmup: u64,
    delivered: AtomicU64,
    measured_samples: AtomicU64,
    measured_bytes: AtomicU64,
    started: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ThroughputReport {
    pub measured_batches: u64,
    pub measured_samples: u64,
    pub measured_bytes: u64,
    pub elapsed_secs: f64,
    pub batches_per_sec: f64,
    pub samples_per_sec: f64,
}

impl ThroughputSink {
    pub fn new(warmup: u64) -> Self {
        Self {
            warmup,
            delivered: AtomicU64::new(0),
            measured_samples: AtomicU64::new(0),
            measured_bytes: AtomicU64::new(0),
            started: Mutex::new(None),
        }
    }

    pub fn warmup(&self) -> u64 {
        self.warmup
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// `None` until the warmup has completed and at least one measured
    /// batch arrived.
    pub fn report(&self) -> Option<ThroughputReport> {
        let delivered = self.delivered.load(Ordering::Relaxed);
        if delivered <= self.warmup {
            return None;
        }
        let started = (*self.started.lock().ok()?)?;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let measured_batches = delivered - self.warmup;
        let measured_samples = self.measured_samples.load(Ordering::Relaxed);
        Some(ThroughputReport {
            measured_batches,
            measured_samples,
            measured_bytes: self.measured_bytes.load(Ordering::Relaxed),
            elapsed_secs: elapsed,
            batches_per_sec: measured_batches as f64 / elapsed,
            samples_per_sec: measured_samples as f64 / elapsed,
        })
    }
}

impl Sink for ThroughputSink {
    fn deliver(&self, batch: ImageBatch) -> Result<()> {
        let n = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        if n == self.warmup {
            let mut guard = self
                .started
                .lock()
                .map_err(|_| anyhow::anyhow!("throughput clock mutex poisoned"))?;
            *guard = Some(Instant::now());
        } else if n > self.warmup {
            if self.warmup == 0 {
                let mut guard = self
                    .started
                    .lock()
                    .map_err(|_| anyhow::anyhow!("throughput clock mutex poisoned"))?;
                guard.get_or_insert_with(Instant::now);
            }
            self.measured_samples
                .fetch_add(batch.batch_size() as u64, Ordering::Relaxed);
            self.measured_bytes
                .fetch_add(batch.payload_bytes(), Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgfeed_core::types::SAMPLE_IMAGE_BYTES;

    fn tiny_batch() -> ImageBatch {
        ImageBatch::new(vec![0u8; 2 * SAMPLE_IMAGE_BYTES], vec![3, 4]).unwrap()
    }

    #[test]
    fn no_report_during_warmup() {
        let sink = ThroughputSink::new(3);
        sink.deliver(tiny_batch()).unwrap();
        sink.deliver(tiny_batch()).unwrap();
        assert!(sink.report().is_none());
    }

    #[test]
    fn report_counts_only_measured_window() {
        let sink = ThroughputSink::new(2);
        for _ in 0..5 {
            sink.deliver(tiny_batch()).unwrap();
        }
        let report = sink.report().unwrap();
        assert_eq!(report.measured_batches, 3);
        assert_eq!(report.measured_samples, 6);
        assert!(report.samples_per_sec > 0.0);
    }

    #[test]
    fn zero_warmup_measures_everything() {
        let sink = ThroughputSink::new(0);
        sink.deliver(tiny_batch()).unwrap();
        let report = sink.report().unwrap();
        assert_eq!(report.measured_batches, 1);
        assert_eq!(report.measured_samples, 2);
    }
}
