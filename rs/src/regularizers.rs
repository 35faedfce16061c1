//! StyleGAN2 adversarial losses and their lazy regularizers.

use tch::{Kind, Tensor};

/// Non-saturating generator loss `softplus(-D(G(z)))`.
pub fn g_nonsaturating_loss(fake_pred: &Tensor) -> Tensor {
    (-fake_pred).softplus().mean(Kind::Float)
}

/// Logistic discriminator loss.
pub fn d_logistic_loss(real_pred: &Tensor, fake_pred: &Tensor) -> Tensor {
    (-real_pred).softplus().mean(Kind::Float) + fake_pred.softplus().mean(Kind::Float)
}

/// R1 penalty: squared norm of `d D(x) / d x` on real samples, batch averaged.
///
/// `real_img` must require grad and `real_pred` must be computed from it.
pub fn d_r1_loss(real_pred: &Tensor, real_img: &Tensor) -> Tensor {
    let mut grads = Tensor::run_backward(&[real_pred.sum(Kind::Float)], &[real_img], true, true);
    let grad_real = grads.swap_remove(0);
    let batch = grad_real.size()[0];
    grad_real
        .square()
        .reshape([batch, -1])
        .sum_dim_intlist(Some([1].as_slice()), false, Kind::Float)
        .mean(Kind::Float)
}

#[derive(Debug)]
pub struct PathLengthPenalty {
    pub penalty: Tensor,
    /// Updated moving average, detached.
    pub mean_path_length: f64,
    pub path_lengths: Tensor,
}

/// Path-length regularization of a decoder output w.r.t. its latent stack.
///
/// `latents` is `[N, n_latent, latent_dim]` and must be part of the graph
/// that produced `fake_img`. The graph is kept so the generator loss can be
/// backpropagated afterwards.
pub fn g_path_regularize(
    fake_img: &Tensor,
    latents: &Tensor,
    mean_path_length: f64,
    decay: f64,
) -> PathLengthPenalty {
    let size = fake_img.size();
    let pixels = (size[2] * size[3]) as f64;
    let noise = fake_img.randn_like() / pixels.sqrt();

    let mut grads = Tensor::run_backward(
        &[(fake_img * &noise).sum(Kind::Float)],
        &[latents],
        true,
        true,
    );
    let grad = grads.swap_remove(0);
    let path_lengths = grad
        .square()
        .sum_dim_intlist(Some([2].as_slice()), false, Kind::Float)
        .mean_dim(Some([1].as_slice()), false, Kind::Float)
        .sqrt();

    let path_mean = (path_lengths.mean(Kind::Float) - mean_path_length) * decay + mean_path_length;
    let penalty = (&path_lengths - &path_mean).square().mean(Kind::Float);

    PathLengthPenalty {
        penalty,
        mean_path_length: path_mean.detach().double_value(&[]),
        path_lengths,
    }
}

/// Lazy regularization interval: a term is evaluated only every `every` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegularizationSchedule {
    every: i64,
}

impl RegularizationSchedule {
    pub fn new(every: i64) -> Self {
        RegularizationSchedule {
            every: every.max(1),
        }
    }

    pub fn every(&self) -> i64 {
        self.every
    }

    pub fn is_due(&self, step: i64) -> bool {
        step % self.every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::Device;

    #[test]
    fn schedule_fires_on_multiples_only() {
        let schedule = RegularizationSchedule::new(4);
        let due: Vec<i64> = (0..10).filter(|&s| schedule.is_due(s)).collect();
        assert_eq!(due, vec![0, 4, 8]);
    }

    #[test]
    fn r1_of_linear_critic_is_squared_weight_norm() {
        // D(x) = sum(2 * x) has gradient 2 everywhere.
        let real = Tensor::randn([2, 1, 2, 2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let pred = (&real * 2.0).sum_dim_intlist(Some([1, 2, 3].as_slice()), false, Kind::Float);
        let penalty = d_r1_loss(&pred, &real);
        assert_abs_diff_eq!(penalty.double_value(&[]), 16.0, epsilon = 1e-5);
    }

    #[test]
    fn logistic_loss_at_zero_logits() {
        let zeros = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let expected = 2.0 * std::f64::consts::LN_2;
        assert_abs_diff_eq!(
            d_logistic_loss(&zeros, &zeros).double_value(&[]),
            expected,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            g_nonsaturating_loss(&zeros).double_value(&[]),
            std::f64::consts::LN_2,
            epsilon = 1e-6
        );
    }

    #[test]
    fn path_mean_moves_towards_observed_lengths() {
        let latents = Tensor::randn([2, 3, 4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let fake = latents.sum_dim_intlist(Some([1, 2].as_slice()), false, Kind::Float)
            .view([2, 1, 1, 1])
            .repeat([1, 1, 4, 4]);
        let result = g_path_regularize(&fake, &latents, 0.0, 0.01);
        let observed = result.path_lengths.mean(Kind::Float).double_value(&[]);
        assert_abs_diff_eq!(result.mean_path_length, 0.01 * observed, epsilon = 1e-9);
        assert!(result.penalty.double_value(&[]) >= 0.0);
    }

    #[test]
    fn penalty_differentiates_through_the_updated_mean() {
        let latents = Tensor::randn([3, 2, 4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let fake = latents
            .square()
            .sum_dim_intlist(Some([1, 2].as_slice()), false, Kind::Float)
            .view([3, 1, 1, 1])
            .repeat([1, 1, 2, 2]);
        // decay 1 moves the mean all the way to the batch mean
        let result = g_path_regularize(&fake, &latents, 0.0, 1.0);
        let lengths = &result.path_lengths;
        let expected = (lengths - lengths.mean(Kind::Float)).square().mean(Kind::Float);
        assert_abs_diff_eq!(
            result.penalty.double_value(&[]),
            expected.double_value(&[]),
            epsilon = 1e-6
        );

        let grad = Tensor::run_backward(&[&result.penalty], &[&latents], true, false).swap_remove(0);
        let expected_grad = Tensor::run_backward(&[&expected], &[&latents], true, false).swap_remove(0);
        assert!(grad.allclose(&expected_grad, 1e-5, 1e-6, false));
    }
}
