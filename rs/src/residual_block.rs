use anyhow::Result;
use tch::{nn, nn::Module, Tensor};

use crate::blur::Blur;
use crate::ops::fused_leaky_relu;

/// Downsampling residual block of the StyleGAN2 discriminator.
#[derive(Debug)]
pub struct ResidualBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    blur: Blur,
    skip_blur: Blur,
    skip: nn::Conv2D,
}

impl ResidualBlock {
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64) -> Result<Self> {
        let conv1 = nn::conv2d(
            vs / "conv1",
            in_channels,
            in_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let conv2 = nn::conv2d(
            vs / "conv2",
            in_channels,
            out_channels,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );
        let skip = nn::conv2d(
            vs / "skip",
            in_channels,
            out_channels,
            1,
            nn::ConvConfig {
                stride: 2,
                bias: false,
                ..Default::default()
            },
        );
        let blur = Blur::new(&(vs / "blur"), in_channels, (2, 1))?;
        let skip_blur = Blur::new(&(vs / "skip_blur"), in_channels, (2, 1))?;

        Ok(ResidualBlock {
            conv1,
            conv2,
            blur,
            skip_blur,
            skip,
        })
    }
}

impl Module for ResidualBlock {
    fn forward(&self, x: &Tensor) -> Tensor {
        let residual = x.apply(&self.skip_blur).apply(&self.skip);
        let x = fused_leaky_relu(&x.apply(&self.conv1));
        let x = fused_leaky_relu(&x.apply(&self.blur).apply(&self.conv2));
        (x + residual) / std::f64::consts::SQRT_2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn halves_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResidualBlock::new(&vs.root(), 4, 8).unwrap();
        let xs = Tensor::randn([2, 4, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs).size(), vec![2, 8, 8, 8]);
    }
}
