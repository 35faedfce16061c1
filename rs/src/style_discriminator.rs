use anyhow::{ensure, Result};
use tch::{nn, nn::Module, Kind, Tensor};

use crate::ops::fused_leaky_relu;
use crate::residual_block::ResidualBlock;

/// StyleGAN2 residual discriminator producing one logit per image.
#[derive(Debug)]
pub struct StyleDiscriminator {
    from_rgb: nn::Conv2D,
    blocks: Vec<ResidualBlock>,
    final_conv: nn::Conv2D,
    final_linear: nn::Linear,
    output: nn::Linear,
    stddev_group: i64,
}

impl StyleDiscriminator {
    pub fn new(
        vs: &nn::Path,
        size: i64,
        image_channels: i64,
        max_channels: i64,
    ) -> Result<Self> {
        ensure!(
            size >= 8 && (size & (size - 1)) == 0,
            "discriminator input size must be a power of two >= 8, got {}",
            size
        );
        let channels = |resolution: i64| (max_channels * 32 / resolution).clamp(1, max_channels);

        let from_rgb = nn::conv2d(
            vs / "from_rgb",
            image_channels,
            channels(size),
            1,
            Default::default(),
        );

        let mut blocks = Vec::new();
        let mut resolution = size;
        while resolution > 4 {
            blocks.push(ResidualBlock::new(
                &(vs / format!("block_{}", resolution)),
                channels(resolution),
                channels(resolution / 2),
            )?);
            resolution /= 2;
        }

        let final_channels = channels(4);
        let final_conv = nn::conv2d(
            vs / "final_conv",
            final_channels + 1,
            final_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let final_linear = nn::linear(
            vs / "final_linear",
            final_channels * 4 * 4,
            final_channels,
            Default::default(),
        );
        let output = nn::linear(vs / "output", final_channels, 1, Default::default());

        Ok(StyleDiscriminator {
            from_rgb,
            blocks,
            final_conv,
            final_linear,
            output,
            stddev_group: 4,
        })
    }

    /// Appends the minibatch standard deviation as an extra feature map.
    fn minibatch_stddev(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (batch, channels, height, width) = (size[0], size[1], size[2], size[3]);
        let group = (1..=self.stddev_group.min(batch))
            .rev()
            .find(|g| batch % g == 0)
            .unwrap_or(1);

        let stddev = xs.view([group, batch / group, 1, channels, height, width]);
        let stddev = (stddev.var_dim(Some([0].as_slice()), false, false) + 1e-8).sqrt();
        let stddev = stddev
            .mean_dim(Some([2, 3, 4].as_slice()), true, Kind::Float)
            .squeeze_dim(2)
            .repeat([group, 1, height, width]);
        Tensor::cat(&[xs, &stddev], 1)
    }
}

impl Module for StyleDiscriminator {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut out = fused_leaky_relu(&xs.apply(&self.from_rgb));
        for block in &self.blocks {
            out = block.forward(&out);
        }
        let out = self.minibatch_stddev(&out);
        let out = fused_leaky_relu(&out.apply(&self.final_conv));
        let out = fused_leaky_relu(&out.flatten(1, -1).apply(&self.final_linear));
        out.apply(&self.output)
    }
}
