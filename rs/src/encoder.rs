use anyhow::{ensure, Result};
use tch::{nn, nn::ModuleT, Tensor};

use crate::instance_norm::InstanceNorm2d;
use crate::resnet_generator::ResnetBlock;

/// Image encoder used as a generator by the StyleGAN2 model.
///
/// Produces a W code `[N, latent_dim]`, or a W+ stack
/// `[N, n_latent, latent_dim]` when built with `wplus_layers`.
#[derive(Debug)]
pub struct LatentEncoder {
    features: nn::SequentialT,
    head: nn::Linear,
    latent_dim: i64,
    wplus_layers: Option<i64>,
}

impl LatentEncoder {
    pub fn new(
        vs: &nn::Path,
        input_nc: i64,
        ngf: i64,
        n_blocks: i64,
        img_size: i64,
        latent_dim: i64,
        wplus_layers: Option<i64>,
    ) -> Result<Self> {
        ensure!(img_size >= 8, "encoder input size must be >= 8, got {}", img_size);

        let mut features = nn::seq_t()
            .add_fn(|xs| xs.reflection_pad2d([3, 3, 3, 3]))
            .add(nn::conv2d(vs / "conv_in", input_nc, ngf, 7, Default::default()))
            .add(InstanceNorm2d::new(&(vs / "norm_in"), ngf, false))
            .add_fn(|xs| xs.relu());

        // Downsample until the feature map is 8x8.
        let n_down = ((img_size as f64).log2().round() as i64 - 3).max(1);
        let mut channels = ngf;
        for i in 0..n_down {
            let next = (channels * 2).min(ngf * 8);
            features = features
                .add(nn::conv2d(
                    vs / format!("down_{}", i),
                    channels,
                    next,
                    3,
                    nn::ConvConfig {
                        stride: 2,
                        padding: 1,
                        ..Default::default()
                    },
                ))
                .add(InstanceNorm2d::new(&(vs / format!("down_norm_{}", i)), next, false))
                .add_fn(|xs| xs.relu());
            channels = next;
        }
        for i in 0..n_blocks {
            features = features.add(ResnetBlock::new(
                &(vs / format!("block_{}", i)),
                channels,
                false,
            ));
        }
        let features = features
            .add_fn(|xs| xs.adaptive_avg_pool2d([1, 1]))
            .add_fn(|xs| xs.flatten(1, -1));

        let outputs = latent_dim * wplus_layers.unwrap_or(1);
        let head = nn::linear(vs / "head", channels, outputs, Default::default());

        Ok(LatentEncoder {
            features,
            head,
            latent_dim,
            wplus_layers,
        })
    }
}

impl ModuleT for LatentEncoder {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let latent = self.features.forward_t(xs, train).apply(&self.head);
        match self.wplus_layers {
            Some(layers) => latent.view([-1, layers, self.latent_dim]),
            None => latent,
        }
    }
}
