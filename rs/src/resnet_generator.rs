use tch::{nn, nn::ModuleT, Tensor};

use crate::instance_norm::InstanceNorm2d;

/// Residual block with reflection padding, as in the CycleGAN generators.
#[derive(Debug)]
pub struct ResnetBlock {
    conv1: nn::Conv2D,
    norm1: InstanceNorm2d,
    conv2: nn::Conv2D,
    norm2: InstanceNorm2d,
    dropout: bool,
}

impl ResnetBlock {
    pub fn new(vs: &nn::Path, dim: i64, dropout: bool) -> Self {
        let config = nn::ConvConfig {
            bias: false,
            ..Default::default()
        };
        ResnetBlock {
            conv1: nn::conv2d(vs / "conv1", dim, dim, 3, config),
            norm1: InstanceNorm2d::new(&(vs / "norm1"), dim, false),
            conv2: nn::conv2d(vs / "conv2", dim, dim, 3, config),
            norm2: InstanceNorm2d::new(&(vs / "norm2"), dim, false),
            dropout,
        }
    }
}

impl ModuleT for ResnetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .reflection_pad2d([1, 1, 1, 1])
            .apply(&self.conv1)
            .apply(&self.norm1)
            .relu();
        let ys = if self.dropout { ys.dropout(0.5, train) } else { ys };
        let ys = ys
            .reflection_pad2d([1, 1, 1, 1])
            .apply(&self.conv2)
            .apply(&self.norm2);
        xs + ys
    }
}

/// ResNet image-to-image generator: two downsamplings, residual blocks, two
/// upsamplings and a `tanh` output.
#[derive(Debug)]
pub struct ResnetGenerator {
    model: nn::SequentialT,
}

impl ResnetGenerator {
    pub fn new(
        vs: &nn::Path,
        input_nc: i64,
        output_nc: i64,
        ngf: i64,
        n_blocks: i64,
        dropout: bool,
    ) -> Self {
        let no_bias = nn::ConvConfig {
            bias: false,
            ..Default::default()
        };

        let mut model = nn::seq_t()
            .add_fn(|xs| xs.reflection_pad2d([3, 3, 3, 3]))
            .add(nn::conv2d(vs / "conv_in", input_nc, ngf, 7, no_bias))
            .add(InstanceNorm2d::new(&(vs / "norm_in"), ngf, false))
            .add_fn(|xs| xs.relu());

        for i in 0..2 {
            let mult = 1 << i;
            model = model
                .add(nn::conv2d(
                    vs / format!("down_{}", i),
                    ngf * mult,
                    ngf * mult * 2,
                    3,
                    nn::ConvConfig {
                        stride: 2,
                        padding: 1,
                        bias: false,
                        ..Default::default()
                    },
                ))
                .add(InstanceNorm2d::new(
                    &(vs / format!("down_norm_{}", i)),
                    ngf * mult * 2,
                    false,
                ))
                .add_fn(|xs| xs.relu());
        }

        for i in 0..n_blocks {
            model = model.add(ResnetBlock::new(&(vs / format!("block_{}", i)), ngf * 4, dropout));
        }

        for i in 0..2 {
            let mult = 1 << (2 - i);
            model = model
                .add(nn::conv_transpose2d(
                    vs / format!("up_{}", i),
                    ngf * mult,
                    ngf * mult / 2,
                    3,
                    nn::ConvTransposeConfig {
                        stride: 2,
                        padding: 1,
                        output_padding: 1,
                        bias: false,
                        ..Default::default()
                    },
                ))
                .add(InstanceNorm2d::new(
                    &(vs / format!("up_norm_{}", i)),
                    ngf * mult / 2,
                    false,
                ))
                .add_fn(|xs| xs.relu());
        }

        let model = model
            .add_fn(|xs| xs.reflection_pad2d([3, 3, 3, 3]))
            .add(nn::conv2d(vs / "conv_out", ngf, output_nc, 7, Default::default()))
            .add_fn(|xs| xs.tanh());

        ResnetGenerator { model }
    }
}

impl ModuleT for ResnetGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.model.forward_t(xs, train)
    }
}
