// generator.rs

use anyhow::{ensure, Result};
use tch::{nn, nn::Module, Tensor};

use crate::mapping_network::MappingNetwork;
use crate::style_layer::{StyleLayer, ToRgb};

/// How a latent code is turned into an image by [`Decoder::decode`].
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions<'a> {
    /// The code is already in W (or W+) space and skips the mapping network.
    pub input_is_latent: bool,
    /// Truncation factor, `1.0` disables the trick.
    pub truncation: f64,
    pub truncation_latent: Option<&'a Tensor>,
    pub randomize_noise: bool,
}

impl Default for DecodeOptions<'_> {
    fn default() -> Self {
        DecodeOptions {
            input_is_latent: true,
            truncation: 1.0,
            truncation_latent: None,
            randomize_noise: false,
        }
    }
}

#[derive(Debug)]
pub struct DecoderOutput {
    pub image: Tensor,
    /// Per-layer latent stack `[N, n_latent, latent_dim]` fed to the layers.
    pub latents: Tensor,
}

/// StyleGAN2 synthesis network decoding W / W+ codes into images.
#[derive(Debug)]
pub struct Decoder {
    mapping: MappingNetwork,
    input: Tensor,
    conv1: StyleLayer,
    to_rgb1: ToRgb,
    blocks: Vec<(StyleLayer, StyleLayer, ToRgb)>,
    n_latent: i64,
}

/// Number of per-layer latents consumed by a decoder of the given size.
pub fn latent_count(size: i64) -> i64 {
    let log_size = (size as f64).log2().round() as i64;
    log_size * 2 - 2
}

impl Decoder {
    pub fn new(
        vs: &nn::Path,
        size: i64,
        latent_dim: i64,
        max_channels: i64,
        image_channels: i64,
        mapping_layers: i64,
    ) -> Result<Self> {
        ensure!(
            size >= 8 && (size & (size - 1)) == 0,
            "decoder size must be a power of two >= 8, got {}",
            size
        );
        let channels = |resolution: i64| (max_channels * 32 / resolution).clamp(1, max_channels);

        let mapping = MappingNetwork::new(&(vs / "mapping"), latent_dim, mapping_layers);
        let input = vs.var(
            "input",
            &[1, channels(4), 4, 4],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        );
        let conv1 = StyleLayer::new(
            &(vs / "conv1"),
            latent_dim,
            channels(4),
            channels(4),
            4,
            false,
        )?;
        let to_rgb1 = ToRgb::new(&(vs / "to_rgb1"), latent_dim, channels(4), image_channels, false)?;

        let mut blocks = Vec::new();
        let mut resolution = 8;
        while resolution <= size {
            let in_c = channels(resolution / 2);
            let out_c = channels(resolution);
            let path = vs / format!("block_{}", resolution);
            let up = StyleLayer::new(&(&path / "up"), latent_dim, in_c, out_c, resolution, true)?;
            let conv = StyleLayer::new(&(&path / "conv"), latent_dim, out_c, out_c, resolution, false)?;
            let to_rgb = ToRgb::new(&(&path / "to_rgb"), latent_dim, out_c, image_channels, true)?;
            blocks.push((up, conv, to_rgb));
            resolution *= 2;
        }

        Ok(Decoder {
            mapping,
            input,
            conv1,
            to_rgb1,
            blocks,
            n_latent: latent_count(size),
        })
    }

    pub fn n_latent(&self) -> i64 {
        self.n_latent
    }

    /// Mean W used as the truncation centre.
    pub fn mean_latent(&self, samples: i64) -> Tensor {
        self.mapping.mean_latent(samples)
    }

    pub fn decode(&self, latent: &Tensor, options: &DecodeOptions) -> DecoderOutput {
        let latent = if options.input_is_latent {
            latent.shallow_clone()
        } else {
            self.mapping.forward(latent)
        };

        let latent = match options.truncation_latent {
            Some(mean) if options.truncation < 1.0 => {
                let mean = if latent.dim() == 3 {
                    mean.unsqueeze(1)
                } else {
                    mean.shallow_clone()
                };
                &mean + (&latent - &mean) * options.truncation
            }
            _ => latent,
        };

        // W codes are shared by every layer, W+ codes come one per layer.
        let latents = if latent.dim() == 2 {
            latent.unsqueeze(1).repeat([1, self.n_latent, 1])
        } else {
            latent
        };
        let style = |index: i64| latents.select(1, index);

        let batch = latents.size()[0];
        let xs = self.input.repeat([batch, 1, 1, 1]);
        let xs = self.conv1.forward(&xs, &style(0), options.randomize_noise);
        let mut skip = self.to_rgb1.forward(&xs, &style(1), None);

        let mut xs = xs;
        let mut index = 1;
        for (up, conv, to_rgb) in &self.blocks {
            xs = up.forward(&xs, &style(index), options.randomize_noise);
            xs = conv.forward(&xs, &style(index + 1), options.randomize_noise);
            skip = to_rgb.forward(&xs, &style(index + 2), Some(&skip));
            index += 2;
        }

        DecoderOutput {
            image: skip,
            latents,
        }
    }
}
