use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use imgfeed_core::types::{ImageBatch, SAMPLE_IMAGE_BYTES};
use imgfeed_flow::sink::Sink;
use imgfeed_wire::{decode_batch, ZmqSender};

fn unique_endpoint(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("ipc://@imgfeed-test-{tag}-{}-{nanos}", std::process::id())
}

fn sample_batch() -> ImageBatch {
    let mut images = vec![0u8; 3 * SAMPLE_IMAGE_BYTES];
    for (i, b) in images.iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    ImageBatch::new(images, vec![5, 0, 999]).unwrap()
}

#[test]
fn pull_consumer_receives_and_decodes_batches() -> Result<()> {
    let endpoint = unique_endpoint("roundtrip");
    let sender = ZmqSender::bind(&endpoint, 150)?;
    assert_eq!(sender.endpoint(), endpoint);

    let context = zmq::Context::new();
    let pull = context.socket(zmq::PULL)?;
    pull.set_rcvtimeo(5000)?;
    pull.connect(&endpoint)?;
    // Give the connect a moment so the first send does not sit in the
    // mute state.
    std::thread::sleep(Duration::from_millis(100));

    let batch = sample_batch();
    for _ in 0..3 {
        sender.deliver(batch.clone())?;
    }

    for _ in 0..3 {
        let frame = pull.recv_bytes(0)?;
        let decoded = decode_batch(&frame)?;
        assert_eq!(decoded.images, batch.images);
        assert_eq!(decoded.labels, batch.labels);
        assert_eq!(decoded.image_dims(), [3, 224, 224, 3]);
    }

    Ok(())
}
