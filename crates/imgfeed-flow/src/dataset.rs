use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use imgfeed_core::types::{ImageBatch, NUM_CLASSES, SAMPLE_IMAGE_BYTES};

/// One undecoded dataset entry: file location plus its class label.
#[derive(Debug, Clone)]
pub struct SampleRef {
    pub path: PathBuf,
    pub label: i32,
}

/// ILSVRC12-layout dataset: `<root>/train/<class>/<file>`.
///
/// Class directories sorted lexicographically define label ids, so the
/// mapping is stable across hosts as long as the directory names are.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    entries: Vec<SampleRef>,
}

impl ImageFolder {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let train_dir = root.join("train");

        let mut class_dirs: Vec<PathBuf> = Vec::new();
        let rd = std::fs::read_dir(&train_dir)
            .with_context(|| format!("read dataset dir failed: {}", train_dir.display()))?;
        for entry in rd {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                class_dirs.push(entry.path());
            }
        }
        class_dirs.sort();
        anyhow::ensure!(
            !class_dirs.is_empty(),
            "no class directories under {}",
            train_dir.display()
        );
        anyhow::ensure!(
            class_dirs.len() <= NUM_CLASSES as usize,
            "{} class directories exceed the {} class contract",
            class_dirs.len(),
            NUM_CLASSES
        );

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut entries = Vec::new();
        for (label, dir) in class_dirs.iter().enumerate() {
            let class_name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("non-utf8 class dir: {}", dir.display()))?;

            let mut files: Vec<PathBuf> = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
            for path in files {
                entries.push(SampleRef {
                    path,
                    label: label as i32,
                });
            }
            classes.push(class_name);
        }
        anyhow::ensure!(
            !entries.is_empty(),
            "no sample files under {}",
            train_dir.display()
        );

        info!(
            root = %root.display(),
            classes = classes.len(),
            samples = entries.len(),
            "opened imagefolder dataset"
        );

        Ok(Self {
            root,
            classes,
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sample order for one epoch: a seeded shuffle so every worker layout
    /// reproduces the same stream for the same (seed, epoch) pair.
    pub fn epoch_order(&self, seed: u64, epoch: u64) -> Vec<SampleRef> {
        let mut order = self.entries.clone();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch.wrapping_mul(0x9E37_79B9)));
        order.shuffle(&mut rng);
        order
    }
}

/// Builds the synthetic template batch for fake-data mode.
///
/// Pixel and label contents are drawn once from a seeded RNG and the same
/// batch is then served repeatedly, so downstream timing is not perturbed
/// by generation cost.
pub fn fake_batch(batch_size: usize, seed: u64) -> Result<ImageBatch> {
    anyhow::ensure!(batch_size > 0, "batch size must be > 0");
    let mut rng = StdRng::seed_from_u64(seed);

    let mut images = vec![0u8; batch_size * SAMPLE_IMAGE_BYTES];
    rng.fill(images.as_mut_slice());

    let labels: Vec<i32> = (0..batch_size)
        .map(|_| rng.gen_range(0..NUM_CLASSES))
        .collect();

    Ok(ImageBatch::new(images, labels)?)
}
