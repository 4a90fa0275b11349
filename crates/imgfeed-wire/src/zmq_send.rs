use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::info;

use imgfeed_core::config::WIRE_FORMAT;
use imgfeed_core::types::ImageBatch;
use imgfeed_flow::sink::Sink;

use crate::codec::encode_batch;

/// PUSH-socket batch sender.
///
/// Binds (rather than connects) so the trainer side can come and go; the
/// send high-water mark bounds the outstanding unsent batches, after which
/// `send` blocks and backpressure propagates up the pipeline. ZeroMQ
/// sockets are not `Sync`, so the socket sits behind a mutex to satisfy
/// the `Sink` bound; delivery is single-consumer in practice.
pub struct ZmqSender {
    socket: Mutex<zmq::Socket>,
    endpoint: String,
    _context: zmq::Context,
}

impl ZmqSender {
    pub fn bind(endpoint: &str, hwm: i32) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::PUSH)
            .context("create PUSH socket failed")?;
        socket
            .set_sndhwm(hwm)
            .with_context(|| format!("set send high-water mark {hwm} failed"))?;
        // A full send queue must not block process exit when the context
        // drops; the default linger is infinite.
        socket.set_linger(0).context("set linger failed")?;
        socket
            .bind(endpoint)
            .with_context(|| format!("bind {endpoint} failed"))?;

        info!(
            endpoint = %endpoint,
            hwm = hwm,
            format = WIRE_FORMAT,
            "batch sender bound"
        );

        Ok(Self {
            socket: Mutex::new(socket),
            endpoint: endpoint.to_string(),
            _context: context,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Sink for ZmqSender {
    fn deliver(&self, batch: ImageBatch) -> Result<()> {
        let frame = encode_batch(&batch);
        let socket = self.socket.lock();
        socket
            .send(&frame[..], 0)
            .with_context(|| format!("send on {} failed", self.endpoint))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn bind_sets_a_bounded_linger() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let endpoint = format!("ipc://@imgfeed-linger-{}-{nanos}", std::process::id());

        let sender = ZmqSender::bind(&endpoint, 10).unwrap();
        assert_eq!(sender.socket.lock().get_linger().unwrap(), 0);
    }
}
