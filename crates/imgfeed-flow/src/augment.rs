use anyhow::Result;
use image::{imageops, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use imgfeed_core::types::{AugPolicy, CROP_SIZE};

use crate::decode::{resize_rgb, resize_shortest_edge};

/// One per-sample image transform. Chains run left to right on each sample
/// before batching.
pub trait Augmentor: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, img: RgbImage, rng: &mut StdRng) -> Result<RgbImage>;
}

/// The augmentor sequence for a named policy.
///
/// `fbresnet` is the fb.resnet.torch training recipe: inception-style
/// random sized crop, color jitter in random order, horizontal flip.
/// `small` is the cheap recipe: shortest-edge resize, random crop, flip.
pub fn chain_for(policy: AugPolicy) -> Vec<Box<dyn Augmentor>> {
    match policy {
        AugPolicy::Fbresnet => vec![
            Box::new(RandomSizedCrop {
                target: CROP_SIZE,
                min_area_frac: 0.08,
            }),
            Box::new(ColorJitter { max_delta: 0.4 }),
            Box::new(HorizontalFlip { prob: 0.5 }),
        ],
        AugPolicy::Small => vec![
            Box::new(ResizeShortestEdge { size: 256 }),
            Box::new(RandomCrop { size: CROP_SIZE }),
            Box::new(HorizontalFlip { prob: 0.5 }),
        ],
    }
}

pub fn apply_chain(
    chain: &[Box<dyn Augmentor>],
    img: RgbImage,
    rng: &mut StdRng,
) -> Result<RgbImage> {
    let mut img = img;
    for aug in chain {
        img = aug.apply(img, rng)?;
    }
    Ok(img)
}

fn crop(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
    imageops::crop_imm(img, x, y, w, h).to_image()
}

fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let x = (w.saturating_sub(size)) / 2;
    let y = (h.saturating_sub(size)) / 2;
    crop(img, x, y, size.min(w), size.min(h))
}

/// Inception-style crop: sample a region covering 8-100% of the source
/// area with aspect ratio in [3/4, 4/3], then resize it to `target`.
/// After 10 failed attempts, fall back to a shortest-edge resize plus
/// center crop.
pub struct RandomSizedCrop {
    pub target: u32,
    pub min_area_frac: f32,
}

impl Augmentor for RandomSizedCrop {
    fn name(&self) -> &'static str {
        "random_sized_crop"
    }

    fn apply(&self, img: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        let (w, h) = img.dimensions();
        let area = (w as f32) * (h as f32);

        for _ in 0..10 {
            let target_area = area * rng.gen_range(self.min_area_frac..=1.0);
            let aspect = rng.gen_range(0.75f32..=(4.0 / 3.0));
            let cw = (target_area * aspect).sqrt().round() as u32;
            let ch = (target_area / aspect).sqrt().round() as u32;
            if cw == 0 || ch == 0 || cw > w || ch > h {
                continue;
            }
            let x = rng.gen_range(0..=(w - cw));
            let y = rng.gen_range(0..=(h - ch));
            let region = crop(&img, x, y, cw, ch);
            return resize_rgb(&region, self.target, self.target);
        }

        let resized = resize_shortest_edge(&img, self.target)?;
        let centered = center_crop(&resized, self.target);
        resize_rgb(&centered, self.target, self.target)
    }
}

/// Brightness, contrast and saturation jitter applied in random order,
/// each with a factor drawn from [1-max_delta, 1+max_delta].
pub struct ColorJitter {
    pub max_delta: f32,
}

impl ColorJitter {
    fn brightness(img: &mut RgbImage, factor: f32) {
        for p in img.pixels_mut() {
            for c in &mut p.0 {
                *c = (*c as f32 * factor).clamp(0.0, 255.0) as u8;
            }
        }
    }

    fn contrast(img: &mut RgbImage, factor: f32) {
        let n = (img.width() as u64 * img.height() as u64 * 3).max(1);
        let sum: u64 = img.as_raw().iter().map(|&v| v as u64).sum();
        let mean = sum as f32 / n as f32;
        for p in img.pixels_mut() {
            for c in &mut p.0 {
                *c = (mean + (*c as f32 - mean) * factor).clamp(0.0, 255.0) as u8;
            }
        }
    }

    fn saturation(img: &mut RgbImage, factor: f32) {
        for p in img.pixels_mut() {
            let [r, g, b] = p.0;
            let gray = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            p.0 = [
                (gray + (r as f32 - gray) * factor).clamp(0.0, 255.0) as u8,
                (gray + (g as f32 - gray) * factor).clamp(0.0, 255.0) as u8,
                (gray + (b as f32 - gray) * factor).clamp(0.0, 255.0) as u8,
            ];
        }
    }
}

impl Augmentor for ColorJitter {
    fn name(&self) -> &'static str {
        "color_jitter"
    }

    fn apply(&self, mut img: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        let mut ops: [u8; 3] = [0, 1, 2];
        ops.shuffle(rng);
        for op in ops {
            let factor = rng.gen_range(1.0 - self.max_delta..=1.0 + self.max_delta);
            match op {
                0 => Self::brightness(&mut img, factor),
                1 => Self::contrast(&mut img, factor),
                _ => Self::saturation(&mut img, factor),
            }
        }
        Ok(img)
    }
}

pub struct HorizontalFlip {
    pub prob: f64,
}

impl Augmentor for HorizontalFlip {
    fn name(&self) -> &'static str {
        "horizontal_flip"
    }

    fn apply(&self, img: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        if rng.gen_bool(self.prob) {
            Ok(imageops::flip_horizontal(&img))
        } else {
            Ok(img)
        }
    }
}

pub struct ResizeShortestEdge {
    pub size: u32,
}

impl Augmentor for ResizeShortestEdge {
    fn name(&self) -> &'static str {
        "resize_shortest_edge"
    }

    fn apply(&self, img: RgbImage, _rng: &mut StdRng) -> Result<RgbImage> {
        resize_shortest_edge(&img, self.size)
    }
}

pub struct RandomCrop {
    pub size: u32,
}

impl Augmentor for RandomCrop {
    fn name(&self) -> &'static str {
        "random_crop"
    }

    fn apply(&self, img: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        let (w, h) = img.dimensions();
        // Upstream resize keeps both edges >= size; guard for odd inputs.
        if w < self.size || h < self.size {
            let resized = resize_shortest_edge(&img, self.size)?;
            return self.apply(resized, rng);
        }
        let x = rng.gen_range(0..=(w - self.size));
        let y = rng.gen_range(0..=(h - self.size));
        Ok(crop(&img, x, y, self.size, self.size))
    }
}
