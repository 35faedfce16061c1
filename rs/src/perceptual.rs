use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use tch::{nn, Device, Kind, Tensor};

use crate::ops::resize_bilinear;

/// VGG16 `features` layers grouped into the four slices compared by the
/// perceptual loss (up to relu1_2, relu2_2, relu3_3 and relu4_3).
const VGG16_SLICES: [&[i64]; 4] = [&[64, 64], &[128, 128], &[256, 256, 256], &[512, 512, 512]];

/// L1 distance between VGG16 feature maps of two image batches.
///
/// Inputs are expected in `[-1, 1]`; they are mapped to ImageNet statistics
/// and resized to 224x224 before the feature extractor. The VGG weights live
/// in their own frozen store.
#[derive(Debug)]
pub struct PerceptualLoss {
    _vs: nn::VarStore,
    slices: Vec<Vec<nn::Conv2D>>,
    mean: Tensor,
    std: Tensor,
    resize: bool,
}

impl PerceptualLoss {
    /// Builds the feature extractor, loading torchvision-named weights
    /// (`features.{index}.weight`) when a file is given.
    pub fn new(device: Device, weights: Option<&Path>, resize: bool) -> Result<Self> {
        let mut vs = nn::VarStore::new(device);
        let features = vs.root() / "features";

        let mut slices = Vec::with_capacity(VGG16_SLICES.len());
        let mut in_channels = 3;
        // torchvision numbering: conv, relu, ..., maxpool between slices
        let mut index = 0;
        for (slice_index, widths) in VGG16_SLICES.iter().enumerate() {
            if slice_index > 0 {
                index += 1;
            }
            let mut convs = Vec::with_capacity(widths.len());
            for &width in widths.iter() {
                convs.push(nn::conv2d(
                    &features / index,
                    in_channels,
                    width,
                    3,
                    nn::ConvConfig {
                        padding: 1,
                        ..Default::default()
                    },
                ));
                in_channels = width;
                index += 2;
            }
            slices.push(convs);
        }

        if let Some(path) = weights {
            vs.load_partial(path)
                .with_context(|| format!("loading VGG16 weights from {}", path.display()))?;
            info!("loaded perceptual VGG16 weights from {}", path.display());
        } else {
            warn!("perceptual VGG16 features use random weights");
        }
        vs.freeze();

        let mean = Tensor::from_slice(&[0.485f32, 0.456, 0.406])
            .view([1, 3, 1, 1])
            .to_device(device);
        let std = Tensor::from_slice(&[0.229f32, 0.224, 0.225])
            .view([1, 3, 1, 1])
            .to_device(device);

        Ok(PerceptualLoss {
            _vs: vs,
            slices,
            mean,
            std,
            resize,
        })
    }

    fn prepare(&self, xs: &Tensor) -> Tensor {
        let xs = if xs.size()[1] == 1 {
            xs.repeat([1, 3, 1, 1])
        } else {
            xs.shallow_clone()
        };
        let xs = ((xs + 1.0) / 2.0 - &self.mean) / &self.std;
        if self.resize {
            resize_bilinear(&xs, 224, 224)
        } else {
            xs
        }
    }

    pub fn loss(&self, input: &Tensor, target: &Tensor) -> Tensor {
        let mut x = self.prepare(input);
        let mut y = self.prepare(target);
        let mut total = Tensor::zeros([1], (Kind::Float, input.device())).sum(Kind::Float);

        for (slice_index, convs) in self.slices.iter().enumerate() {
            if slice_index > 0 {
                x = x.max_pool2d_default(2);
                y = y.max_pool2d_default(2);
            }
            for conv in convs {
                x = x.apply(conv).relu();
                y = y.apply(conv).relu();
            }
            total = total + x.l1_loss(&y, tch::Reduction::Mean);
        }
        total
    }
}
