use tch::{nn, Kind, Tensor};

/// Per-pixel noise scaled by a learned strength.
///
/// A fixed noise map is drawn once at construction and used whenever the
/// decoder runs with `randomize_noise = false`.
#[derive(Debug)]
pub struct NoiseInjection {
    weight: Tensor,
    fixed: Tensor,
}

impl NoiseInjection {
    pub fn new(vs: &nn::Path, resolution: i64) -> Self {
        let weight = vs.zeros("weight", &[1]);
        let mut fixed = vs.zeros_no_train("fixed", &[1, 1, resolution, resolution]);
        tch::no_grad(|| {
            fixed.copy_(&Tensor::randn(
                [1, 1, resolution, resolution],
                (Kind::Float, vs.device()),
            ))
        });

        NoiseInjection { weight, fixed }
    }

    pub fn forward(&self, xs: &Tensor, randomize: bool) -> Tensor {
        let size = xs.size();
        let noise = if randomize {
            Tensor::randn([size[0], 1, size[2], size[3]], (xs.kind(), xs.device()))
        } else {
            self.fixed.shallow_clone()
        };
        xs + &self.weight * noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn zero_strength_leaves_input_untouched() {
        let vs = nn::VarStore::new(Device::Cpu);
        let noise = NoiseInjection::new(&vs.root(), 8);
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        assert!(noise.forward(&xs, true).allclose(&xs, 1e-6, 1e-6, false));
    }

    #[test]
    fn fixed_noise_is_deterministic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let noise = NoiseInjection::new(&vs.root(), 4);
        let xs = Tensor::zeros([1, 2, 4, 4], (Kind::Float, Device::Cpu));
        let first = noise.forward(&xs, false);
        let second = noise.forward(&xs, false);
        assert!(first.equal(&second));
    }
}
