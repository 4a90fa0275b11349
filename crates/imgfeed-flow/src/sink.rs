use anyhow::Result;

use imgfeed_core::types::ImageBatch;

/// Delivery interface at the end of the dataflow.
///
/// Delivery is intentionally synchronous: a slow sink must exert
/// backpressure (i.e., block upstream) so the pipeline stays RAM-bounded.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, batch: ImageBatch) -> Result<()>;
}
