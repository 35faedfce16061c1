//! CycleGAN trained on label-mask regions of interest.
//!
//! The labeled region of each image is cropped and resized to full
//! resolution, translated, then pasted back into the out-of-mask real image.
//! Full-image discriminators judge the composite; optional patch
//! discriminators judge the translated crop.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use log::{debug, info};
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Tensor};

use super::{backward_d_basic, label_visual, scalar, TrainingModel};
use crate::checkpoint::{self, network_file_name};
use crate::config::TrainConfig;
use crate::data::Batch;
use crate::discriminator::NLayerDiscriminator;
use crate::error::MaskError;
use crate::losses::{zero_loss, GanLoss, ReconstructionLoss};
use crate::mask::{extract_patches, out_of_mask, paste_patches, BoundingBox};
use crate::resnet_generator::ResnetGenerator;

struct PatchDiscriminators {
    d_a: NLayerDiscriminator,
    d_b: NLayerDiscriminator,
}

struct MaskPatchInput {
    full_real_a: Tensor,
    full_real_b: Tensor,
    label_a: Tensor,
    label_b: Tensor,
    /// Region-of-interest crops resized to full resolution.
    real_a: Tensor,
    real_b: Tensor,
    boxes_a: Vec<BoundingBox>,
    boxes_b: Vec<BoundingBox>,
    image_paths: Vec<PathBuf>,
}

/// Forward outputs of one training step.
pub struct MaskPatchStep {
    pub real_a_out_mask: Tensor,
    pub real_b_out_mask: Tensor,
    pub fake_b: Tensor,
    pub rec_a: Tensor,
    pub fake_a: Tensor,
    pub rec_b: Tensor,
    pub full_fake_b: Tensor,
    pub full_fake_a: Tensor,
}

pub struct MaskPatchModel {
    g_vs: nn::VarStore,
    d_vs: nn::VarStore,
    g_a: ResnetGenerator,
    g_b: ResnetGenerator,
    d_a_full: NLayerDiscriminator,
    d_b_full: NLayerDiscriminator,
    d_patch: Option<PatchDiscriminators>,
    opt_g: nn::Optimizer,
    opt_d: nn::Optimizer,
    criterion_gan: GanLoss,
    criterion_rec: ReconstructionLoss,
    lambda_a: f64,
    lambda_b: f64,
    lambda_identity: f64,
    use_context_g: bool,
    direction: crate::config::Direction,
    device: Device,
    input: Option<MaskPatchInput>,
    losses: Vec<(&'static str, f64)>,
    visuals: Vec<(&'static str, Tensor)>,
}

impl MaskPatchModel {
    pub fn new(config: &TrainConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let options = &config.mask_patch;
        let (input_nc, output_nc) = (config.input_nc, config.output_nc);
        if options.use_context_g {
            ensure!(
                input_nc == output_nc,
                "context generators need input_nc == output_nc"
            );
        }
        let context = if options.use_context_g { 2 } else { 1 };

        let g_vs = nn::VarStore::new(device);
        let root = g_vs.root();
        let g_a = ResnetGenerator::new(
            &(&root / "g_a"),
            context * input_nc,
            output_nc,
            config.ngf,
            config.n_blocks_g,
            config.dropout,
        );
        let g_b = ResnetGenerator::new(
            &(&root / "g_b"),
            context * output_nc,
            input_nc,
            config.ngf,
            config.n_blocks_g,
            config.dropout,
        );

        let d_vs = nn::VarStore::new(device);
        let root = d_vs.root();
        let d_a_full = NLayerDiscriminator::new(&(&root / "d_a_full"), output_nc, config.ndf, config.n_layers_d);
        let d_b_full = NLayerDiscriminator::new(&(&root / "d_b_full"), input_nc, config.ndf, config.n_layers_d);
        let d_patch = options.use_disc_patch.then(|| PatchDiscriminators {
            d_a: NLayerDiscriminator::new(&(&root / "d_a_patch"), output_nc, config.ndf, config.n_layers_d),
            d_b: NLayerDiscriminator::new(&(&root / "d_b_patch"), input_nc, config.ndf, config.n_layers_d),
        });

        let opt_g = nn::adam(config.beta1, 0.999, 0.).build(&g_vs, config.lr)?;
        let opt_d = nn::adam(config.beta1, 0.999, 0.).build(&d_vs, config.lr)?;

        info!(
            "mask-patch model: context_g={} disc_patch={} device={:?}",
            options.use_context_g, options.use_disc_patch, device
        );

        Ok(MaskPatchModel {
            g_vs,
            d_vs,
            g_a,
            g_b,
            d_a_full,
            d_b_full,
            d_patch,
            opt_g,
            opt_d,
            criterion_gan: GanLoss::new(config.gan_mode, config.real_label()),
            criterion_rec: ReconstructionLoss::L1,
            lambda_a: config.lambda_a,
            lambda_b: config.lambda_b,
            lambda_identity: config.lambda_identity,
            use_context_g: options.use_context_g,
            direction: config.direction,
            device,
            input: None,
            losses: Vec::new(),
            visuals: Vec::new(),
        })
    }

    fn network_names(&self) -> Vec<&'static str> {
        let mut names = vec!["g_a", "g_b", "d_a_full", "d_b_full"];
        if self.d_patch.is_some() {
            names.extend(["d_a_patch", "d_b_patch"]);
        }
        names
    }

    fn store_of(&self, name: &str) -> &nn::VarStore {
        if name.starts_with("g_") {
            &self.g_vs
        } else {
            &self.d_vs
        }
    }

    /// Generator input, with the out-of-mask context appended when enabled.
    fn generator_input(&self, patch: &Tensor, out_mask: &Tensor) -> Tensor {
        if self.use_context_g {
            Tensor::cat(&[patch, out_mask], 1)
        } else {
            patch.shallow_clone()
        }
    }

    pub fn forward(&self) -> Result<MaskPatchStep> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("forward called before set_input"))?;

        let real_a_out_mask = out_of_mask(&input.full_real_a, &input.label_a);
        let real_b_out_mask = out_of_mask(&input.full_real_b, &input.label_b);

        let fake_b = self
            .g_a
            .forward_t(&self.generator_input(&input.real_a, &real_a_out_mask), true);
        let rec_a = self
            .g_b
            .forward_t(&self.generator_input(&fake_b, &real_a_out_mask), true);
        let fake_a = self
            .g_b
            .forward_t(&self.generator_input(&input.real_b, &real_b_out_mask), true);
        let rec_b = self
            .g_a
            .forward_t(&self.generator_input(&fake_a, &real_b_out_mask), true);

        let full_fake_b = paste_patches(&fake_b, &real_a_out_mask, &input.boxes_a);
        let full_fake_a = paste_patches(&fake_a, &real_b_out_mask, &input.boxes_b);

        Ok(MaskPatchStep {
            real_a_out_mask,
            real_b_out_mask,
            fake_b,
            rec_a,
            fake_a,
            rec_b,
            full_fake_b,
            full_fake_a,
        })
    }

    fn backward_g(&self, input: &MaskPatchInput, step: &MaskPatchStep) -> (Vec<(&'static str, f64)>, Option<(Tensor, Tensor)>) {
        let (idt_a, idt_b, loss_idt_a, loss_idt_b) = if self.lambda_identity > 0.0 {
            let idt_a = self
                .g_a
                .forward_t(&self.generator_input(&input.real_b, &step.real_b_out_mask), true);
            let idt_b = self
                .g_b
                .forward_t(&self.generator_input(&input.real_a, &step.real_a_out_mask), true);
            let loss_idt_a =
                self.criterion_rec.loss(&idt_a, &input.real_b) * (self.lambda_b * self.lambda_identity);
            let loss_idt_b =
                self.criterion_rec.loss(&idt_b, &input.real_a) * (self.lambda_a * self.lambda_identity);
            (Some(idt_a), Some(idt_b), loss_idt_a, loss_idt_b)
        } else {
            (None, None, zero_loss(self.device), zero_loss(self.device))
        };

        let loss_g_a = self
            .criterion_gan
            .loss(&self.d_a_full.forward_t(&step.full_fake_b, true), true);
        let loss_g_b = self
            .criterion_gan
            .loss(&self.d_b_full.forward_t(&step.full_fake_a, true), true);
        let loss_cycle_a = self.criterion_rec.loss(&step.rec_a, &input.real_a) * self.lambda_a;
        let loss_cycle_b = self.criterion_rec.loss(&step.rec_b, &input.real_b) * self.lambda_b;

        let mut loss_g = &loss_g_a + &loss_g_b + &loss_cycle_a + &loss_cycle_b + &loss_idt_a + &loss_idt_b;

        let patch_losses = self.d_patch.as_ref().map(|patch| {
            let loss_g_a_2 = self
                .criterion_gan
                .loss(&patch.d_a.forward_t(&step.fake_b, true), true);
            let loss_g_b_2 = self
                .criterion_gan
                .loss(&patch.d_b.forward_t(&step.fake_a, true), true);
            (loss_g_a_2, loss_g_b_2)
        });
        if let Some((loss_g_a_2, loss_g_b_2)) = &patch_losses {
            loss_g = loss_g + loss_g_a_2 + loss_g_b_2;
        }
        loss_g.backward();

        let mut losses = vec![
            ("G_A", scalar(&loss_g_a)),
            ("cycle_A", scalar(&loss_cycle_a)),
            ("idt_A", scalar(&loss_idt_a)),
            ("G_B", scalar(&loss_g_b)),
            ("cycle_B", scalar(&loss_cycle_b)),
            ("idt_B", scalar(&loss_idt_b)),
        ];
        if let Some((loss_g_a_2, loss_g_b_2)) = &patch_losses {
            losses.push(("G_A_2", scalar(loss_g_a_2)));
            losses.push(("G_B_2", scalar(loss_g_b_2)));
        }
        let identities = idt_a.zip(idt_b);
        (losses, identities)
    }

    fn backward_d(&self, input: &MaskPatchInput, step: &MaskPatchStep) -> Vec<(&'static str, f64)> {
        let loss_d_a_full = backward_d_basic(
            &self.d_a_full,
            &input.full_real_b,
            &step.full_fake_b,
            &self.criterion_gan,
        );
        let loss_d_b_full = backward_d_basic(
            &self.d_b_full,
            &input.full_real_a,
            &step.full_fake_a,
            &self.criterion_gan,
        );
        let mut losses = vec![
            ("D_A_full", scalar(&loss_d_a_full)),
            ("D_B_full", scalar(&loss_d_b_full)),
        ];
        if let Some(patch) = &self.d_patch {
            let loss_d_a_patch =
                backward_d_basic(&patch.d_a, &input.real_b, &step.fake_b, &self.criterion_gan);
            let loss_d_b_patch =
                backward_d_basic(&patch.d_b, &input.real_a, &step.fake_a, &self.criterion_gan);
            losses.push(("D_A_patch", scalar(&loss_d_a_patch)));
            losses.push(("D_B_patch", scalar(&loss_d_b_patch)));
        }
        losses
    }

    pub fn image_paths(&self) -> &[PathBuf] {
        self.input.as_ref().map(|i| i.image_paths.as_slice()).unwrap_or(&[])
    }
}

fn loss_value(losses: &[(&'static str, f64)], name: &str) -> f64 {
    losses
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
        .unwrap_or(0.0)
}

impl TrainingModel for MaskPatchModel {
    fn name(&self) -> &'static str {
        "mask_patch"
    }

    fn set_input(&mut self, batch: Batch) -> Result<()> {
        let batch = batch.oriented(self.direction).to_device(self.device);
        let label_a = batch.label_a.ok_or(MaskError::MissingLabel { domain: 'A' })?;
        let label_b = batch.label_b.ok_or(MaskError::MissingLabel { domain: 'B' })?;

        let (real_a, boxes_a) = extract_patches(&batch.a, &label_a)?;
        let (real_b, boxes_b) = extract_patches(&batch.b, &label_b)?;
        debug!("boxes A {:?} B {:?}", boxes_a, boxes_b);

        self.input = Some(MaskPatchInput {
            full_real_a: batch.a,
            full_real_b: batch.b,
            label_a,
            label_b,
            real_a,
            real_b,
            boxes_a,
            boxes_b,
            image_paths: batch.a_paths,
        });
        Ok(())
    }

    fn optimize_parameters(&mut self) -> Result<()> {
        let step = self.forward()?;
        let input = self
            .input
            .take()
            .ok_or_else(|| anyhow::anyhow!("optimize_parameters called before set_input"))?;

        // generators
        self.d_vs.freeze();
        self.g_vs.unfreeze();
        self.opt_g.zero_grad();
        let (g_losses, identities) = self.backward_g(&input, &step);
        self.opt_g.step();

        // discriminators
        self.d_vs.unfreeze();
        self.opt_d.zero_grad();
        let d_losses = self.backward_d(&input, &step);
        self.opt_d.step();

        let mut order = vec![
            "D_A_full", "G_A", "cycle_A", "idt_A", "D_B_full", "G_B", "cycle_B", "idt_B",
        ];
        if self.d_patch.is_some() {
            order.extend(["G_A_2", "G_B_2", "D_A_patch", "D_B_patch"]);
        }
        let all: Vec<(&'static str, f64)> = g_losses.into_iter().chain(d_losses).collect();
        self.losses = order.into_iter().map(|name| (name, loss_value(&all, name))).collect();

        let mut visuals_a = vec![
            ("real_A", input.real_a.shallow_clone()),
            ("fake_B", step.fake_b.detach()),
            ("rec_A", step.rec_a.detach()),
        ];
        let mut visuals_b = vec![
            ("real_B", input.real_b.shallow_clone()),
            ("fake_A", step.fake_a.detach()),
            ("rec_B", step.rec_b.detach()),
        ];
        if let Some((idt_a, idt_b)) = identities {
            visuals_a.push(("idt_B", idt_b.detach()));
            visuals_b.push(("idt_A", idt_a.detach()));
        }
        visuals_a.extend([
            ("input_A_label", label_visual(&input.label_a)),
            ("real_A_out_mask", step.real_a_out_mask.detach()),
            ("full_real_A", input.full_real_a.shallow_clone()),
            ("full_fake_B", step.full_fake_b.detach()),
        ]);
        visuals_b.extend([
            ("input_B_label", label_visual(&input.label_b)),
            ("real_B_out_mask", step.real_b_out_mask.detach()),
            ("full_real_B", input.full_real_b.shallow_clone()),
            ("full_fake_A", step.full_fake_a.detach()),
        ]);
        self.visuals = visuals_a.into_iter().chain(visuals_b).collect();

        self.input = Some(input);
        Ok(())
    }

    fn current_losses(&self) -> Vec<(&'static str, f64)> {
        self.losses.clone()
    }

    fn current_visuals(&self) -> Vec<(&'static str, Tensor)> {
        self.visuals
            .iter()
            .map(|(name, tensor)| (*name, tensor.shallow_clone()))
            .collect()
    }

    fn save_networks(&self, dir: &Path, tag: &str) -> Result<Vec<PathBuf>> {
        let mut written = checkpoint::save_networks(&self.g_vs, &["g_a", "g_b"], dir, tag)?;
        let d_names: Vec<&str> = self
            .network_names()
            .into_iter()
            .filter(|name| name.starts_with("d_"))
            .collect();
        written.extend(checkpoint::save_networks(&self.d_vs, &d_names, dir, tag)?);
        Ok(written)
    }

    fn load_networks(&mut self, dir: &Path, tag: &str) -> Result<()> {
        for name in self.network_names() {
            let path = dir.join(network_file_name(tag, name));
            let restored = checkpoint::load_network(self.store_of(name), name, &path)?;
            info!("loaded {} tensors into {} from {}", restored, name, path.display());
        }
        Ok(())
    }
}
