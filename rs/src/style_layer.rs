use anyhow::Result;
use tch::{nn, Kind, Tensor};

use crate::blur::Blur;
use crate::noise_injection::NoiseInjection;
use crate::ops::fused_leaky_relu;

/// Convolution whose weights are modulated per sample by a style vector.
#[derive(Debug)]
pub struct ModulatedConv2d {
    weight: Tensor,
    modulation: nn::Linear,
    scale: f64,
    in_channels: i64,
    out_channels: i64,
    kernel_size: i64,
    demodulate: bool,
}

impl ModulatedConv2d {
    pub fn new(
        vs: &nn::Path,
        latent_dim: i64,
        in_channels: i64,
        out_channels: i64,
        kernel_size: i64,
        demodulate: bool,
    ) -> Self {
        let weight = vs.var(
            "weight",
            &[1, out_channels, in_channels, kernel_size, kernel_size],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        );
        let modulation = nn::linear(
            vs / "modulation",
            latent_dim,
            in_channels,
            nn::LinearConfig {
                bs_init: Some(nn::Init::Const(1.0)),
                ..Default::default()
            },
        );
        let fan_in = (in_channels * kernel_size * kernel_size) as f64;

        ModulatedConv2d {
            weight,
            modulation,
            scale: 1.0 / fan_in.sqrt(),
            in_channels,
            out_channels,
            kernel_size,
            demodulate,
        }
    }

    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> Tensor {
        let size = xs.size();
        let (batch, height, width) = (size[0], size[2], size[3]);
        let (in_c, out_c, k) = (self.in_channels, self.out_channels, self.kernel_size);

        let style = style.apply(&self.modulation).view([batch, 1, in_c, 1, 1]);
        let weight = &self.weight * self.scale * style;
        let weight = if self.demodulate {
            let demod = (weight
                .square()
                .sum_dim_intlist(Some([2, 3, 4].as_slice()), false, Kind::Float)
                + 1e-8)
                .rsqrt();
            weight * demod.view([batch, out_c, 1, 1, 1])
        } else {
            weight
        };

        // One grouped convolution runs every sample with its own weights.
        let weight = weight.view([batch * out_c, in_c, k, k]);
        let out = xs.reshape([1, batch * in_c, height, width]).conv2d::<Tensor>(
            &weight,
            None,
            [1, 1],
            [k / 2, k / 2],
            [1, 1],
            batch,
        );
        let out_size = out.size();
        out.view([batch, out_c, out_size[2], out_size[3]])
    }
}

/// Styled 3x3 convolution with optional 2x upsampling, noise and bias.
#[derive(Debug)]
pub struct StyleLayer {
    noise_injection: NoiseInjection,
    conv: ModulatedConv2d,
    bias: Tensor,
    upsample: Option<Blur>,
}

impl StyleLayer {
    pub fn new(
        vs: &nn::Path,
        latent_dim: i64,
        in_channels: i64,
        out_channels: i64,
        resolution: i64,
        upsample: bool,
    ) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            &(vs / "conv"),
            latent_dim,
            in_channels,
            out_channels,
            3,
            true,
        );
        let noise_injection = NoiseInjection::new(&(vs / "noise"), resolution);
        let bias = vs.zeros("bias", &[1, out_channels, 1, 1]);
        let upsample = if upsample {
            Some(Blur::new(&(vs / "blur"), in_channels, (2, 1))?)
        } else {
            None
        };

        Ok(StyleLayer {
            noise_injection,
            conv,
            bias,
            upsample,
        })
    }

    pub fn forward(&self, xs: &Tensor, w: &Tensor, randomize_noise: bool) -> Tensor {
        let xs = match &self.upsample {
            Some(blur) => blur.upsample(xs),
            None => xs.shallow_clone(),
        };
        let xs = self.conv.forward(&xs, w);
        let xs = self.noise_injection.forward(&xs, randomize_noise);
        fused_leaky_relu(&(xs + &self.bias))
    }
}

/// 1x1 modulated projection to image channels, accumulated over resolutions.
#[derive(Debug)]
pub struct ToRgb {
    conv: ModulatedConv2d,
    bias: Tensor,
    upsample: Option<Blur>,
}

impl ToRgb {
    pub fn new(
        vs: &nn::Path,
        latent_dim: i64,
        in_channels: i64,
        image_channels: i64,
        upsample: bool,
    ) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            &(vs / "conv"),
            latent_dim,
            in_channels,
            image_channels,
            1,
            false,
        );
        let bias = vs.zeros("bias", &[1, image_channels, 1, 1]);
        let upsample = if upsample {
            Some(Blur::new(&(vs / "blur"), image_channels, (2, 1))?)
        } else {
            None
        };
        Ok(ToRgb {
            conv,
            bias,
            upsample,
        })
    }

    pub fn forward(&self, xs: &Tensor, w: &Tensor, skip: Option<&Tensor>) -> Tensor {
        let out = self.conv.forward(xs, w) + &self.bias;
        match (skip, &self.upsample) {
            (Some(skip), Some(blur)) => out + blur.upsample(skip),
            (Some(skip), None) => out + skip,
            (None, _) => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn modulated_conv_keeps_spatial_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = ModulatedConv2d::new(&vs.root(), 8, 4, 6, 3, true);
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        let style = Tensor::randn([2, 8], (Kind::Float, Device::Cpu));
        assert_eq!(conv.forward(&xs, &style).size(), vec![2, 6, 8, 8]);
    }

    #[test]
    fn upsampling_layer_doubles_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = StyleLayer::new(&vs.root(), 8, 4, 4, 16, true).unwrap();
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        let w = Tensor::randn([2, 8], (Kind::Float, Device::Cpu));
        assert_eq!(layer.forward(&xs, &w, false).size(), vec![2, 4, 16, 16]);
    }
}
