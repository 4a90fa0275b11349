use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the served image tensor (HxW).
pub const CROP_SIZE: u32 = 224;

/// Channels per pixel (RGB).
pub const CHANNELS: u32 = 3;

/// Number of label classes in the ILSVRC12 contract.
pub const NUM_CLASSES: i32 = 1000;

/// Bytes of image payload per sample at the served shape.
pub const SAMPLE_IMAGE_BYTES: usize = (CROP_SIZE * CROP_SIZE * CHANNELS) as usize;

/// One decoded, augmented training sample: RGB8 pixels in row-major HWC
/// order at `CROP_SIZE` x `CROP_SIZE`, plus its label id.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<u8>,
    pub label: i32,
}

impl Sample {
    pub fn validate(&self) -> Result<(), BatchShapeError> {
        if self.pixels.len() != SAMPLE_IMAGE_BYTES {
            return Err(BatchShapeError::SamplePayload {
                got: self.pixels.len(),
                want: SAMPLE_IMAGE_BYTES,
            });
        }
        if self.label < 0 || self.label >= NUM_CLASSES {
            return Err(BatchShapeError::LabelOutOfRange { label: self.label });
        }
        Ok(())
    }
}

/// A batch is the unit of delivery to the consumer.
///
/// Invariants:
/// - `images.len() == batch_size * CROP_SIZE * CROP_SIZE * CHANNELS`
/// - `labels.len() == batch_size`
/// - every label is in `0..NUM_CLASSES`
///
/// Tensor contract on the wire: images `(B, 224, 224, 3)` u8 (NHWC),
/// labels `(B,)` i32.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: Arc<[u8]>,
    pub labels: Arc<[i32]>,
}

impl ImageBatch {
    pub fn new(images: Vec<u8>, labels: Vec<i32>) -> Result<Self, BatchShapeError> {
        let batch = Self {
            images: Arc::from(images.as_slice()),
            labels: Arc::from(labels.as_slice()),
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn batch_size(&self) -> usize {
        self.labels.len()
    }

    pub fn image_payload_len(&self) -> usize {
        self.images.len()
    }

    /// Total payload bytes accounted against the inflight budget.
    pub fn payload_bytes(&self) -> u64 {
        (self.images.len() + self.labels.len() * std::mem::size_of::<i32>()) as u64
    }

    /// NHWC dims of the image tensor.
    pub fn image_dims(&self) -> [u64; 4] {
        [
            self.batch_size() as u64,
            CROP_SIZE as u64,
            CROP_SIZE as u64,
            CHANNELS as u64,
        ]
    }

    pub fn validate(&self) -> Result<(), BatchShapeError> {
        let want = self
            .labels
            .len()
            .checked_mul(SAMPLE_IMAGE_BYTES)
            .ok_or(BatchShapeError::Overflow)?;
        if self.images.len() != want {
            return Err(BatchShapeError::ImagePayload {
                got: self.images.len(),
                want,
            });
        }
        if let Some(&label) = self
            .labels
            .iter()
            .find(|&&l| l < 0 || l >= NUM_CLASSES)
        {
            return Err(BatchShapeError::LabelOutOfRange { label });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchShapeError {
    #[error("image payload is {got} bytes, want {want}")]
    ImagePayload { got: usize, want: usize },
    #[error("sample payload is {got} bytes, want {want}")]
    SamplePayload { got: usize, want: usize },
    #[error("label {label} outside 0..{}", NUM_CLASSES)]
    LabelOutOfRange { label: i32 },
    #[error("payload size overflow")]
    Overflow,
}

/// Augmentation policy selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AugPolicy {
    Fbresnet,
    Small,
}

impl AugPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AugPolicy::Fbresnet => "fbresnet",
            AugPolicy::Small => "small",
        }
    }
}
