use tch::{nn, Kind, Tensor};

/// Instance normalization over the spatial dimensions of a `[N, C, H, W]` batch.
///
/// Statistics are always computed from the input, there are no running
/// buffers. The affine parameters are optional.
#[derive(Debug)]
pub struct InstanceNorm2d {
    gamma: Option<Tensor>,
    beta: Option<Tensor>,
    epsilon: f64,
}

impl InstanceNorm2d {
    pub fn new(vs: &nn::Path, channels: i64, affine: bool) -> Self {
        let (gamma, beta) = if affine {
            (
                Some(vs.ones("weight", &[channels])),
                Some(vs.zeros("bias", &[channels])),
            )
        } else {
            (None, None)
        };

        InstanceNorm2d {
            gamma,
            beta,
            epsilon: 1e-5,
        }
    }
}

/// Per-sample, per-channel mean and biased variance, kept broadcastable.
pub fn instance_statistics(input: &Tensor) -> (Tensor, Tensor) {
    let mu = input.mean_dim(Some([2, 3].as_slice()), true, Kind::Float);
    let sigma_squared = (input - &mu)
        .square()
        .mean_dim(Some([2, 3].as_slice()), true, Kind::Float);
    (mu, sigma_squared)
}

impl nn::Module for InstanceNorm2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (mu, sigma_squared) = instance_statistics(xs);
        let output = (xs - mu) / (sigma_squared + self.epsilon).sqrt();

        match (&self.gamma, &self.beta) {
            (Some(gamma), Some(beta)) => {
                output * gamma.view([1, -1, 1, 1]) + beta.view([1, -1, 1, 1])
            }
            _ => output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::Module, Device};

    #[test]
    fn output_is_normalized_per_channel() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = InstanceNorm2d::new(&vs.root(), 3, false);
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu)) * 5.0 + 2.0;
        let ys = norm.forward(&xs);

        let (mu, var) = instance_statistics(&ys);
        assert!(mu.abs().max().double_value(&[]) < 1e-4);
        assert!((var - 1.0).abs().max().double_value(&[]) < 1e-2);
    }
}
