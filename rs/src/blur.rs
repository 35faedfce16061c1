use thiserror::Error;
use tch::{nn, Kind, Tensor};

use crate::ops::resize_nearest;

#[derive(Debug, Error)]
pub enum BlurError {
    #[error("Invalid channels: {0}")]
    InvalidChannels(String),
    #[error("Invalid kernel: {0}")]
    InvalidKernel(String),
}

/// Depthwise FIR low-pass filter, the `[1, 3, 3, 1]` kernel of StyleGAN2.
///
/// The filter is applied with `(pad_before, pad_after)` zero padding on both
/// spatial axes, so a 4-tap kernel with padding `(2, 1)` keeps the size.
#[derive(Debug)]
pub struct Blur {
    kernel: Tensor,
    channels: i64,
    pad: (i64, i64),
}

impl Blur {
    pub fn new(vs: &nn::Path, channels: i64, pad: (i64, i64)) -> Result<Self, BlurError> {
        Self::with_taps(vs, channels, &[1.0, 3.0, 3.0, 1.0], pad)
    }

    pub fn with_taps(
        vs: &nn::Path,
        channels: i64,
        taps: &[f32],
        pad: (i64, i64),
    ) -> Result<Self, BlurError> {
        if channels <= 0 {
            return Err(BlurError::InvalidChannels(
                "Channels must be a positive integer".to_string(),
            ));
        }
        if taps.is_empty() {
            return Err(BlurError::InvalidKernel("no filter taps".to_string()));
        }

        let taps = Tensor::from_slice(taps).to_device(vs.device());
        let kernel_2d = taps.outer(&taps);
        let kernel_2d = &kernel_2d / kernel_2d.sum(Kind::Float);
        let size = taps.size()[0];
        let kernel = kernel_2d
            .flip([0, 1])
            .view([1, 1, size, size])
            .repeat([channels, 1, 1, 1]);

        Ok(Blur {
            kernel,
            channels,
            pad,
        })
    }

    /// Nearest 2x upsampling followed by the low-pass filter.
    pub fn upsample(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let upsampled = resize_nearest(xs, size[2] * 2, size[3] * 2);
        nn::Module::forward(self, &upsampled)
    }
}

impl nn::Module for Blur {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (before, after) = self.pad;
        xs.constant_pad_nd([before, after, before, after])
            .conv2d::<Tensor>(&self.kernel, None, [1, 1], [0, 0], [1, 1], self.channels)
    }
}
