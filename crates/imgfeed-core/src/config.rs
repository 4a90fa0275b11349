/// Hard cap on prefetch workers regardless of core count.
pub const MAX_PREFETCH_WORKERS: usize = 50;

/// Default send-side high-water mark (outstanding batches) for the sender.
pub const DEFAULT_SEND_HWM: i32 = 150;

/// Batches discarded before the benchmark starts timing.
pub const DEFAULT_WARMUP_BATCHES: u64 = 300;

/// Measured window of the benchmark after warmup.
pub const DEFAULT_BENCH_BATCHES: u64 = 5000;

/// Name of the batch serialization format advertised by the sender.
pub const WIRE_FORMAT: &str = "ndtensor-v0";

/// The interprocess endpoint the trainer connects to, parameterized by the
/// per-device batch size. `@` selects the abstract socket namespace, so no
/// filesystem path is created.
pub fn train_endpoint(batch: usize) -> String {
    format!("ipc://@imagenet-train-b{batch}")
}

/// Prefetch worker count: one per core, capped at `MAX_PREFETCH_WORKERS`,
/// never zero.
pub fn prefetch_workers(cores: usize) -> usize {
    cores.clamp(1, MAX_PREFETCH_WORKERS)
}

/// Detected core count of this host.
pub fn detected_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_batch_size() {
        assert_eq!(train_endpoint(32), "ipc://@imagenet-train-b32");
        assert_eq!(train_endpoint(1), "ipc://@imagenet-train-b1");
        assert_eq!(train_endpoint(4096), "ipc://@imagenet-train-b4096");
    }

    #[test]
    fn worker_clamp_is_min_of_cap_and_cores() {
        assert_eq!(prefetch_workers(1), 1);
        assert_eq!(prefetch_workers(8), 8);
        assert_eq!(prefetch_workers(49), 49);
        assert_eq!(prefetch_workers(50), 50);
        assert_eq!(prefetch_workers(51), 50);
        assert_eq!(prefetch_workers(256), 50);
    }

    #[test]
    fn worker_clamp_floor_is_one() {
        assert_eq!(prefetch_workers(0), 1);
    }
}
