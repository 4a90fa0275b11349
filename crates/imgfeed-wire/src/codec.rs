use thiserror::Error;

use imgfeed_core::types::{BatchShapeError, ImageBatch, CHANNELS, CROP_SIZE};

/// `ndtensor-v0` frame layout, all integers little-endian:
///
/// ```text
/// u8  version (0)
/// u8  tensor count
/// per tensor:
///   u8  dtype (1 = u8, 2 = i32)
///   u8  rank
///   u64 x rank  dims
///   u64 payload byte length
///   raw payload
/// ```
///
/// An `ImageBatch` is exactly two tensors: images `(B,224,224,3)` u8 and
/// labels `(B,)` i32.
pub const WIRE_VERSION: u8 = 0;

const DTYPE_U8: u8 = 1;
const DTYPE_I32: u8 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated at byte {at}")]
    Truncated { at: usize },
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("expected 2 tensors, frame has {0}")]
    TensorCount(u8),
    #[error("unsupported dtype code {0}")]
    Dtype(u8),
    #[error("tensor rank {got}, want {want}")]
    Rank { got: u8, want: u8 },
    #[error("dims {dims:?} disagree with payload length {len}")]
    DimMismatch { dims: Vec<u64>, len: u64 },
    #[error("image and label tensors disagree on batch size ({images} vs {labels})")]
    BatchSizeMismatch { images: u64, labels: u64 },
    #[error("trailing {0} bytes after frame")]
    TrailingBytes(usize),
    #[error(transparent)]
    Shape(#[from] BatchShapeError),
}

pub fn encode_batch(batch: &ImageBatch) -> Vec<u8> {
    let image_dims = batch.image_dims();
    let label_dims = [batch.batch_size() as u64];

    let mut out = Vec::with_capacity(
        2 + tensor_header_len(image_dims.len())
            + batch.images.len()
            + tensor_header_len(label_dims.len())
            + batch.labels.len() * 4,
    );
    out.push(WIRE_VERSION);
    out.push(2);

    write_tensor_header(&mut out, DTYPE_U8, &image_dims, batch.images.len() as u64);
    out.extend_from_slice(&batch.images);

    write_tensor_header(
        &mut out,
        DTYPE_I32,
        &label_dims,
        (batch.labels.len() * 4) as u64,
    );
    for &label in batch.labels.iter() {
        out.extend_from_slice(&label.to_le_bytes());
    }

    out
}

pub fn decode_batch(frame: &[u8]) -> Result<ImageBatch, WireError> {
    let mut r = Reader { buf: frame, pos: 0 };

    let version = r.u8()?;
    if version != WIRE_VERSION {
        return Err(WireError::Version(version));
    }
    let count = r.u8()?;
    if count != 2 {
        return Err(WireError::TensorCount(count));
    }

    let (image_dims, image_payload) = r.tensor(DTYPE_U8, 4)?;
    let (label_dims, label_payload) = r.tensor(DTYPE_I32, 1)?;

    if r.pos != frame.len() {
        return Err(WireError::TrailingBytes(frame.len() - r.pos));
    }

    // Dims come off the wire; the product must not be trusted to fit.
    let expected_images = image_dims
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| WireError::DimMismatch {
            dims: image_dims.clone(),
            len: image_payload.len() as u64,
        })?;
    if expected_images != image_payload.len() as u64 {
        return Err(WireError::DimMismatch {
            dims: image_dims.clone(),
            len: image_payload.len() as u64,
        });
    }
    if image_dims[1] != CROP_SIZE as u64
        || image_dims[2] != CROP_SIZE as u64
        || image_dims[3] != CHANNELS as u64
    {
        return Err(WireError::DimMismatch {
            dims: image_dims.clone(),
            len: image_payload.len() as u64,
        });
    }
    let expected_labels = label_dims[0].checked_mul(4).ok_or_else(|| WireError::DimMismatch {
        dims: label_dims.clone(),
        len: label_payload.len() as u64,
    })?;
    if expected_labels != label_payload.len() as u64 {
        return Err(WireError::DimMismatch {
            dims: label_dims.clone(),
            len: label_payload.len() as u64,
        });
    }
    if image_dims[0] != label_dims[0] {
        return Err(WireError::BatchSizeMismatch {
            images: image_dims[0],
            labels: label_dims[0],
        });
    }

    let labels: Vec<i32> = label_payload
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(ImageBatch::new(image_payload.to_vec(), labels)?)
}

fn tensor_header_len(rank: usize) -> usize {
    2 + rank * 8 + 8
}

fn write_tensor_header(out: &mut Vec<u8>, dtype: u8, dims: &[u64], payload_len: u64) {
    out.push(dtype);
    out.push(dims.len() as u8);
    for &d in dims {
        out.extend_from_slice(&d.to_le_bytes());
    }
    out.extend_from_slice(&payload_len.to_le_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, WireError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(WireError::Truncated { at: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let end = self
            .pos
            .checked_add(8)
            .ok_or(WireError::Truncated { at: self.pos })?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(WireError::Truncated { at: self.pos })?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        self.pos = end;
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self, len: u64) -> Result<&'a [u8], WireError> {
        let len = usize::try_from(len).map_err(|_| WireError::Truncated { at: self.pos })?;
        let end = self
            .pos
            .checked_add(len)
            .ok_or(WireError::Truncated { at: self.pos })?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(WireError::Truncated { at: self.pos })?;
        self.pos = end;
        Ok(slice)
    }

    fn tensor(&mut self, want_dtype: u8, want_rank: u8) -> Result<(Vec<u64>, &'a [u8]), WireError> {
        let dtype = self.u8()?;
        if dtype != want_dtype {
            return Err(WireError::Dtype(dtype));
        }
        let rank = self.u8()?;
        if rank != want_rank {
            return Err(WireError::Rank {
                got: rank,
                want: want_rank,
            });
        }
        let mut dims = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            dims.push(self.u64()?);
        }
        let len = self.u64()?;
        let payload = self.bytes(len)?;
        Ok((dims, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgfeed_core::types::SAMPLE_IMAGE_BYTES;

    fn sample_batch() -> ImageBatch {
        let mut images = vec![0u8; 2 * SAMPLE_IMAGE_BYTES];
        for (i, b) in images.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        ImageBatch::new(images, vec![17, 942]).unwrap()
    }

    #[test]
    fn roundtrip_preserves_tensors() {
        let batch = sample_batch();
        let frame = encode_batch(&batch);
        let decoded = decode_batch(&frame).unwrap();
        assert_eq!(decoded.images, batch.images);
        assert_eq!(decoded.labels, batch.labels);
        assert_eq!(decoded.image_dims(), [2, 224, 224, 3]);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = encode_batch(&sample_batch());
        for cut in [0usize, 1, 2, 10, frame.len() - 1] {
            let err = decode_batch(&frame[..cut]).unwrap_err();
            assert!(
                matches!(err, WireError::Truncated { .. } | WireError::DimMismatch { .. }),
                "cut at {cut}: {err}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut frame = encode_batch(&sample_batch());
        frame.push(0);
        assert_eq!(decode_batch(&frame).unwrap_err(), WireError::TrailingBytes(1));
    }

    #[test]
    fn overflowing_dims_are_a_typed_error() {
        // Image tensor whose dims multiply past u64, tiny declared payload.
        let mut frame = vec![WIRE_VERSION, 2];
        frame.push(DTYPE_U8);
        frame.push(4);
        for _ in 0..4 {
            frame.extend_from_slice(&(1u64 << 62).to_le_bytes());
        }
        frame.extend_from_slice(&4u64.to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame.push(DTYPE_I32);
        frame.push(1);
        frame.extend_from_slice(&1u64.to_le_bytes());
        frame.extend_from_slice(&4u64.to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);

        let err = decode_batch(&frame).unwrap_err();
        assert!(matches!(err, WireError::DimMismatch { .. }), "{err}");
    }

    #[test]
    fn overflowing_label_dim_is_a_typed_error() {
        let batch = sample_batch();
        let mut frame = encode_batch(&batch);
        // Label dim sits after the header, the image tensor, and the label
        // tensor's dtype + rank bytes.
        let label_dim_offset = 2 + (2 + 4 * 8 + 8) + batch.images.len() + 2;
        frame[label_dim_offset..label_dim_offset + 8]
            .copy_from_slice(&(u64::MAX).to_le_bytes());

        let err = decode_batch(&frame).unwrap_err();
        assert!(matches!(err, WireError::DimMismatch { .. }), "{err}");
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut frame = encode_batch(&sample_batch());
        frame[0] = 9;
        assert_eq!(decode_batch(&frame).unwrap_err(), WireError::Version(9));
    }
}
