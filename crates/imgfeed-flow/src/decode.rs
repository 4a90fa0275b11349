use anyhow::Result;
use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use image::RgbImage;
use zune_jpeg::zune_core::bytestream::ZCursor;
use zune_jpeg::JpegDecoder;

/// Decodes an encoded image into RGB8.
///
/// JPEG goes through zune-jpeg; anything else (or a zune failure on a
/// mislabelled file) falls back to the `image` crate's format sniffing.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if looks_like_jpeg(bytes) {
        if let Some(img) = decode_jpeg_zune(bytes) {
            return Ok(img);
        }
    }
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xD8
}

// Returns `None` when zune cannot produce 3-channel output (grayscale or
// CMYK jpegs among them); the caller falls back to the `image` crate.
fn decode_jpeg_zune(bytes: &[u8]) -> Option<RgbImage> {
    let mut decoder = JpegDecoder::new(ZCursor::new(bytes));
    let pixels = decoder.decode().ok()?;
    let info = decoder.info()?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);
    let expected_len = (width as usize).checked_mul(height as usize)?.checked_mul(3)?;
    if pixels.len() != expected_len {
        return None;
    }
    RgbImage::from_raw(width, height, pixels)
}

/// Resize to exactly (width, height) with a bilinear convolution kernel.
pub fn resize_rgb(img: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    if img.width() == width && img.height() == height {
        return Ok(img.clone());
    }

    let src = FirImage::from_vec_u8(
        img.width(),
        img.height(),
        img.as_raw().clone(),
        FirPixelType::U8x3,
    )?;
    let mut dst = FirImage::new(width, height, FirPixelType::U8x3);
    let mut resizer = FirResizer::new();
    let options =
        FirResizeOptions::new().resize_alg(FirResizeAlg::Convolution(FirFilterType::Bilinear));
    resizer.resize(&src, &mut dst, &options)?;

    RgbImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| anyhow::anyhow!("resize produced a malformed buffer"))
}

/// Resize so the shortest edge is `size`, preserving aspect ratio.
pub fn resize_shortest_edge(img: &RgbImage, size: u32) -> Result<RgbImage> {
    let (w, h) = img.dimensions();
    anyhow::ensure!(w > 0 && h > 0, "empty image");
    let (nw, nh) = if w <= h {
        let scale = size as f32 / w as f32;
        (size, ((h as f32 * scale).round() as u32).max(1))
    } else {
        let scale = size as f32 / h as f32;
        (((w as f32 * scale).round() as u32).max(1), size)
    };
    resize_rgb(img, nw, nh)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn jpeg_roundtrip_decodes_to_rgb() {
        let img = gradient(64, 48);
        let mut encoded = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, 90)
            .encode_image(&img)
            .unwrap();

        let decoded = decode_image(&encoded).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn png_falls_back_to_image_crate() {
        let img = gradient(16, 16);
        let mut encoded = std::io::Cursor::new(Vec::new());
        img.write_to(&mut encoded, image::ImageFormat::Png).unwrap();

        let decoded = decode_image(encoded.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (16, 16));
    }

    #[test]
    fn garbage_bytes_are_an_error() {
        assert!(decode_image(&[0u8; 32]).is_err());
    }

    #[test]
    fn shortest_edge_resize_preserves_aspect() {
        let img = gradient(400, 200);
        let out = resize_shortest_edge(&img, 100).unwrap();
        assert_eq!(out.dimensions(), (200, 100));

        let img = gradient(200, 400);
        let out = resize_shortest_edge(&img, 100).unwrap();
        assert_eq!(out.dimensions(), (100, 200));
    }
}
