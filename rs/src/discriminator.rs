use tch::{nn, nn::ModuleT, Tensor};

use crate::instance_norm::InstanceNorm2d;
use crate::ops::leaky_relu;

/// PatchGAN discriminator: a grid of real/fake logits, one per receptive field.
#[derive(Debug)]
pub struct NLayerDiscriminator {
    model: nn::SequentialT,
}

impl NLayerDiscriminator {
    pub fn new(vs: &nn::Path, input_nc: i64, ndf: i64, n_layers: i64) -> Self {
        let conv = |name: String, in_c: i64, out_c: i64, stride: i64, bias: bool| {
            nn::conv2d(
                vs / name,
                in_c,
                out_c,
                4,
                nn::ConvConfig {
                    stride,
                    padding: 1,
                    bias,
                    ..Default::default()
                },
            )
        };

        let mut model = nn::seq_t()
            .add(conv("conv_0".to_string(), input_nc, ndf, 2, true))
            .add_fn(|xs| leaky_relu(xs, 0.2));

        let mut mult = 1;
        for n in 1..=n_layers {
            let prev = mult;
            mult = (1 << n).min(8);
            let stride = if n == n_layers { 1 } else { 2 };
            model = model
                .add(conv(
                    format!("conv_{}", n),
                    ndf * prev,
                    ndf * mult,
                    stride,
                    false,
                ))
                .add(InstanceNorm2d::new(&(vs / format!("norm_{}", n)), ndf * mult, false))
                .add_fn(|xs| leaky_relu(xs, 0.2));
        }

        let model = model.add(conv("output".to_string(), ndf * mult, 1, 1, true));

        NLayerDiscriminator { model }
    }
}

impl ModuleT for NLayerDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.model.forward_t(xs, train)
    }
}
