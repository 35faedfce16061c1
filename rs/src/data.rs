//! Unaligned two-domain image datasets with per-image label maps.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use tch::{vision::image, Device, Kind, Tensor};

use crate::config::Direction;
use crate::mask::normalize_labels;
use crate::ops::resize_nearest;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// One training batch from both domains.
#[derive(Debug)]
pub struct Batch {
    /// `[N, C, H, W]` in `[-1, 1]`.
    pub a: Tensor,
    pub b: Tensor,
    /// `[N, H, W]` class ids.
    pub label_a: Option<Tensor>,
    pub label_b: Option<Tensor>,
    pub a_paths: Vec<PathBuf>,
    pub b_paths: Vec<PathBuf>,
}

impl Batch {
    /// Swaps the image domains for `BtoA`. Label maps keep their domain keys.
    pub fn oriented(self, direction: Direction) -> Batch {
        match direction {
            Direction::AtoB => self,
            Direction::BtoA => Batch {
                a: self.b,
                b: self.a,
                label_a: self.label_a,
                label_b: self.label_b,
                a_paths: self.b_paths,
                b_paths: self.a_paths,
            },
        }
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            a: self.a.to_device(device),
            b: self.b.to_device(device),
            label_a: self.label_a.as_ref().map(|l| normalize_labels(l).to_device(device)),
            label_b: self.label_b.as_ref().map(|l| normalize_labels(l).to_device(device)),
            a_paths: self.a_paths.clone(),
            b_paths: self.b_paths.clone(),
        }
    }

    pub fn len(&self) -> i64 {
        self.a.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Sample {
    image: PathBuf,
    label: Option<PathBuf>,
}

/// `{root}/{phase}A` and `{root}/{phase}B` image folders with optional
/// `{phase}A_label` / `{phase}B_label` folders holding label maps of the
/// same file stem.
#[derive(Debug)]
pub struct UnalignedDataset {
    a: Vec<Sample>,
    b: Vec<Sample>,
    size: i64,
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

fn load_domain(root: &Path, folder: &str) -> Result<Vec<Sample>> {
    let images = list_images(&root.join(folder))?;
    ensure!(!images.is_empty(), "no images in {}", root.join(folder).display());

    let label_dir = root.join(format!("{}_label", folder));
    let labels: HashMap<String, PathBuf> = if label_dir.is_dir() {
        list_images(&label_dir)?
            .into_iter()
            .filter_map(|path| stem(&path).map(|s| (s, path)))
            .collect()
    } else {
        HashMap::new()
    };

    let samples: Vec<Sample> = images
        .into_iter()
        .map(|image| {
            let label = stem(&image).and_then(|s| labels.get(&s).cloned());
            Sample { image, label }
        })
        .collect();
    let labeled = samples.iter().filter(|s| s.label.is_some()).count();
    info!(
        "{}: {} images, {} with labels",
        root.join(folder).display(),
        samples.len(),
        labeled
    );
    Ok(samples)
}

fn load_image(path: &Path, size: i64) -> Result<Tensor> {
    let image = image::load_and_resize(path, size, size)
        .with_context(|| format!("loading image {}", path.display()))?;
    Ok(image.to_kind(Kind::Float) / 127.5 - 1.0)
}

fn load_label(path: &Path, size: i64) -> Result<Tensor> {
    let label = image::load(path).with_context(|| format!("loading label {}", path.display()))?;
    let label = label.narrow(0, 0, 1).unsqueeze(0).to_kind(Kind::Float);
    Ok(resize_nearest(&label, size, size).squeeze_dim(0).squeeze_dim(0).to_kind(Kind::Int64))
}

impl UnalignedDataset {
    pub fn open(root: &Path, phase: &str, size: i64) -> Result<Self> {
        Ok(UnalignedDataset {
            a: load_domain(root, &format!("{}A", phase))?,
            b: load_domain(root, &format!("{}B", phase))?,
            size,
        })
    }

    /// Epoch length, driven by the larger domain.
    pub fn len(&self) -> usize {
        self.a.len().max(self.b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_samples(&self, samples: &[&Sample]) -> Result<(Tensor, Option<Tensor>, Vec<PathBuf>)> {
        let images = samples
            .iter()
            .map(|s| load_image(&s.image, self.size))
            .collect::<Result<Vec<_>>>()?;
        let labels = if samples.iter().all(|s| s.label.is_some()) {
            let labels = samples
                .iter()
                .filter_map(|s| s.label.as_ref())
                .map(|path| load_label(path, self.size))
                .collect::<Result<Vec<_>>>()?;
            Some(Tensor::stack(&labels, 0))
        } else {
            None
        };
        let paths = samples.iter().map(|s| s.image.clone()).collect();
        Ok((Tensor::stack(&images, 0), labels, paths))
    }

    /// One epoch of batches. A images are visited in (optionally shuffled)
    /// order, B images are drawn at random so the domains stay unaligned.
    pub fn batches(&self, batch_size: usize, shuffle: bool) -> impl Iterator<Item = Result<Batch>> + '_ {
        let mut rng = rand::thread_rng();
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(&mut rng);
        }
        let b_picks: Vec<usize> = (0..self.len())
            .map(|i| if shuffle { rng.gen_range(0..self.b.len()) } else { i % self.b.len() })
            .collect();

        let chunks: Vec<Vec<(usize, usize)>> = order
            .into_iter()
            .zip(b_picks)
            .collect::<Vec<_>>()
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        chunks.into_iter().map(move |chunk| {
            let a: Vec<&Sample> = chunk.iter().map(|(i, _)| &self.a[i % self.a.len()]).collect();
            let b: Vec<&Sample> = chunk.iter().map(|(_, j)| &self.b[*j]).collect();
            let (a, label_a, a_paths) = self.load_samples(&a)?;
            let (b, label_b, b_paths) = self.load_samples(&b)?;
            Ok(Batch {
                a,
                b,
                label_a,
                label_b,
                a_paths,
                b_paths,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch {
            a: Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu)),
            b: Tensor::ones([1, 3, 4, 4], (Kind::Float, Device::Cpu)),
            label_a: Some(Tensor::ones([1, 1, 4, 4], (Kind::Int64, Device::Cpu))),
            label_b: None,
            a_paths: vec![PathBuf::from("a.png")],
            b_paths: vec![PathBuf::from("b.png")],
        }
    }

    #[test]
    fn oriented_swaps_images_but_not_labels() {
        let swapped = batch().oriented(Direction::BtoA);
        assert_eq!(swapped.a.double_value(&[0, 0, 0, 0]), 1.0);
        assert_eq!(swapped.a_paths, vec![PathBuf::from("b.png")]);
        assert!(swapped.label_a.is_some());
        assert!(swapped.label_b.is_none());
    }

    #[test]
    fn to_device_squeezes_label_channel() {
        let moved = batch().to_device(Device::Cpu);
        assert_eq!(moved.label_a.unwrap().size(), vec![1, 4, 4]);
    }

    #[test]
    fn reads_folders_with_labels() {
        let root = tempfile::tempdir().unwrap();
        for folder in ["trainA", "trainB", "trainA_label"] {
            fs::create_dir_all(root.path().join(folder)).unwrap();
        }
        let pixels = Tensor::full([3, 8, 8], 200, (Kind::Uint8, Device::Cpu));
        let mask = Tensor::zeros([3, 8, 8], (Kind::Uint8, Device::Cpu));
        let _ = mask.narrow(1, 2, 3).fill_(1);
        image::save(&pixels, root.path().join("trainA/x.png")).unwrap();
        image::save(&pixels, root.path().join("trainB/y.png")).unwrap();
        image::save(&mask, root.path().join("trainA_label/x.png")).unwrap();

        let dataset = UnalignedDataset::open(root.path(), "train", 8).unwrap();
        assert_eq!(dataset.len(), 1);
        let batch = dataset.batches(1, false).next().unwrap().unwrap();
        assert_eq!(batch.a.size(), vec![1, 3, 8, 8]);
        let label_a = batch.label_a.unwrap();
        assert_eq!(label_a.size(), vec![1, 8, 8]);
        assert_eq!(label_a.gt(0).sum(Kind::Int64).int64_value(&[]), 24);
        assert!(batch.label_b.is_none());
    }
}
