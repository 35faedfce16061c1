//! Training models and the pieces they share.

mod mask_patch;
mod semantic_sty2;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tch::{nn::ModuleT, Tensor};

use crate::config::TrainConfig;
use crate::data::Batch;
use crate::losses::GanLoss;

pub use mask_patch::{MaskPatchModel, MaskPatchStep};
pub use semantic_sty2::{SemanticStyleModel, SemanticStyleStep, SEMANTIC_GATE_THRESHOLD};

/// A model that owns its networks and optimizers and trains one batch at a time.
pub trait TrainingModel {
    fn name(&self) -> &'static str;

    /// Moves a batch to the model's device and prepares the step inputs.
    fn set_input(&mut self, batch: Batch) -> Result<()>;

    /// Runs one full training step on the last input.
    fn optimize_parameters(&mut self) -> Result<()>;

    /// Losses of the last step, in a fixed order.
    fn current_losses(&self) -> Vec<(&'static str, f64)>;

    /// Detached images of the last step.
    fn current_visuals(&self) -> Vec<(&'static str, Tensor)>;

    fn save_networks(&self, dir: &Path, tag: &str) -> Result<Vec<PathBuf>>;

    fn load_networks(&mut self, dir: &Path, tag: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelKind {
    MaskPatch,
    SemanticSty2,
}

pub fn create_model(kind: ModelKind, config: &TrainConfig) -> Result<Box<dyn TrainingModel>> {
    let model: Box<dyn TrainingModel> = match kind {
        ModelKind::MaskPatch => Box::new(MaskPatchModel::new(config)?),
        ModelKind::SemanticSty2 => Box::new(SemanticStyleModel::new(config)?),
    };
    Ok(model)
}

/// Discriminator loss on a real and a fake batch, averaged and backpropagated.
///
/// The fake batch is detached so no gradient reaches its generator.
pub fn backward_d_basic<D: ModuleT + ?Sized>(
    net: &D,
    real: &Tensor,
    fake: &Tensor,
    criterion: &GanLoss,
) -> Tensor {
    let loss_real = criterion.loss(&net.forward_t(real, true), true);
    let loss_fake = criterion.loss(&net.forward_t(&fake.detach(), true), false);
    let loss = (loss_real + loss_fake) * 0.5;
    loss.backward();
    loss
}

pub(crate) fn scalar(loss: &Tensor) -> f64 {
    loss.double_value(&[])
}

/// `[N, H, W]` labels as a displayable `[N, 1, H, W]` float map.
pub(crate) fn label_visual(labels: &Tensor) -> Tensor {
    labels.unsqueeze(1).to_kind(tch::Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discriminator::NLayerDiscriminator;
    use crate::losses::GanMode;
    use tch::{nn, Device, Kind};

    #[test]
    fn basic_discriminator_loss_is_non_negative_and_spares_the_fake() {
        for mode in [GanMode::Lsgan, GanMode::Vanilla] {
            let vs = nn::VarStore::new(Device::Cpu);
            let net = NLayerDiscriminator::new(&vs.root(), 3, 4, 2);
            let real = Tensor::randn([2, 3, 32, 32], (Kind::Float, Device::Cpu));
            let fake =
                Tensor::randn([2, 3, 32, 32], (Kind::Float, Device::Cpu)).set_requires_grad(true);
            let generated = &fake * 1.0;

            let loss = backward_d_basic(&net, &real, &generated, &GanLoss::new(mode, 1.0));
            assert!(scalar(&loss) >= 0.0);
            assert!(!fake.grad().defined());
        }
    }
}
