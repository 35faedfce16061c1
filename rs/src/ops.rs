use tch::Tensor;

/// Leaky ReLU as `max(x, slope * x)`; `slope` must be below 1.
pub fn leaky_relu(xs: &Tensor, slope: f64) -> Tensor {
    xs.maximum(&(xs * slope))
}

/// Leaky ReLU followed by the `sqrt(2)` gain used in StyleGAN2 layers.
pub fn fused_leaky_relu(xs: &Tensor) -> Tensor {
    leaky_relu(xs, 0.2) * std::f64::consts::SQRT_2
}

/// Bilinear resize of a `[N, C, H, W]` batch, corners not aligned.
pub fn resize_bilinear(xs: &Tensor, height: i64, width: i64) -> Tensor {
    xs.upsample_bilinear2d([height, width], false, None::<f64>, None::<f64>)
}

/// Nearest-neighbour resize of a `[N, C, H, W]` batch.
pub fn resize_nearest(xs: &Tensor, height: i64, width: i64) -> Tensor {
    xs.upsample_nearest2d([height, width], None::<f64>, None::<f64>)
}

/// Adds zero-mean gaussian noise with the given standard deviation.
pub fn add_gaussian_noise(xs: &Tensor, stddev: f64) -> Tensor {
    xs + xs.randn_like() * stddev
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn leaky_relu_scales_negative_side_only() {
        let xs = Tensor::from_slice(&[-2.0f32, 0.0, 3.0]);
        let ys = leaky_relu(&xs, 0.2);
        let expected = Tensor::from_slice(&[-0.4f32, 0.0, 3.0]);
        assert!(ys.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn resize_to_same_size_is_identity() {
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let ys = resize_bilinear(&xs, 8, 8);
        assert!(ys.allclose(&xs, 1e-5, 1e-6, false));
    }
}
