use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `IMGFEED_LOG` first, then
/// `RUST_LOG`, then a default.
///
/// Log field contract for the serve process:
/// - Always include `endpoint` and `batch` once the pipeline is assembled.
/// - Include `aug` for any augmentation-related event.
/// - Include `epoch` on epoch boundaries.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("IMGFEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
