use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::ops::fused_leaky_relu;

/// StyleGAN2 mapping network: pixel norm followed by an MLP from Z to W.
#[derive(Debug)]
pub struct MappingNetwork {
    mapping: nn::Sequential,
    latent_dim: i64,
    device: Device,
}

fn pixel_norm(xs: &Tensor) -> Tensor {
    let norm = (xs.square().mean_dim(Some([-1].as_slice()), true, Kind::Float) + 1e-8).rsqrt();
    xs * norm
}

impl MappingNetwork {
    pub fn new(vs: &nn::Path, latent_dim: i64, num_layers: i64) -> Self {
        let mut mapping = nn::seq().add_fn(pixel_norm);
        for i in 0..num_layers {
            mapping = mapping
                .add(nn::linear(
                    vs / format!("linear_{}", i),
                    latent_dim,
                    latent_dim,
                    Default::default(),
                ))
                .add_fn(fused_leaky_relu);
        }
        MappingNetwork {
            mapping,
            latent_dim,
            device: vs.device(),
        }
    }

    /// Average W over `samples` random Z draws, shaped `[1, latent_dim]`.
    pub fn mean_latent(&self, samples: i64) -> Tensor {
        tch::no_grad(|| {
            let z = Tensor::randn([samples, self.latent_dim], (Kind::Float, self.device));
            self.forward(&z)
                .mean_dim(Some([0].as_slice()), true, Kind::Float)
        })
    }
}

impl Module for MappingNetwork {
    fn forward(&self, z: &Tensor) -> Tensor {
        self.mapping.forward(z)
    }
}
