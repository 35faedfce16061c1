//! CycleGAN whose generators are image encoders feeding StyleGAN2 decoders,
//! kept semantically consistent by a jointly trained classifier.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Result};
use log::{debug, info};
use tch::{nn, nn::Module, nn::ModuleT, nn::OptimizerConfig, Device, Tensor};

use super::{backward_d_basic, label_visual, scalar, TrainingModel};
use crate::checkpoint::{self, network_file_name};
use crate::classifier::SemanticClassifier;
use crate::config::{Direction, TrainConfig};
use crate::data::Batch;
use crate::discriminator::NLayerDiscriminator;
use crate::dist::{LocalReducer, Reducer};
use crate::encoder::LatentEncoder;
use crate::error::MaskError;
use crate::generator::{latent_count, DecodeOptions, Decoder, DecoderOutput};
use crate::image_pool::ImagePool;
use crate::losses::{semantic_cross_entropy, zero_loss, GanLoss, OutMaskLoss, ReconstructionLoss};
use crate::mask::{in_mask, out_of_mask};
use crate::ops::add_gaussian_noise;
use crate::perceptual::PerceptualLoss;
use crate::regularizers::{
    d_logistic_loss, d_r1_loss, g_nonsaturating_loss, g_path_regularize, RegularizationSchedule,
};
use crate::style_discriminator::StyleDiscriminator;

/// Semantic losses only count once the classifier loss is at most this.
pub const SEMANTIC_GATE_THRESHOLD: f64 = 1.0;

/// Whether the last classifier loss lets the semantic losses through.
pub fn semantic_gate_open(last_f_s_loss: Option<f64>) -> bool {
    last_f_s_loss.map_or(false, |loss| loss <= SEMANTIC_GATE_THRESHOLD)
}

const NOISE_STDDEV: f64 = 0.1;
const TRUNCATION_SAMPLES: i64 = 4096;
const PATH_LENGTH_DECAY: f64 = 0.01;

struct MaskDiscriminators {
    vs: nn::VarStore,
    d_a: NLayerDiscriminator,
    d_b: NLayerDiscriminator,
    opt: nn::Optimizer,
    fake_b_pool: ImagePool,
    fake_a_pool: ImagePool,
}

struct SemanticInput {
    real_a: Tensor,
    real_b: Tensor,
    label_a: Tensor,
    label_b: Option<Tensor>,
    image_paths: Vec<PathBuf>,
}

/// Out-of-mask views of a translation pair.
pub struct OutMaskPair {
    pub real: Tensor,
    pub fake: Tensor,
}

/// Forward outputs of one training step.
pub struct SemanticStyleStep {
    pub fake_b: Tensor,
    /// W+ stack that produced `fake_b`.
    pub latent_fake_b: Tensor,
    pub rec_a: Tensor,
    pub fake_a: Tensor,
    pub latent_fake_a: Tensor,
    pub rec_b: Tensor,
    pub pred_fake_a: Tensor,
    pub pred_fake_b: Tensor,
    /// Classifier argmax on `real_B`, detached.
    pub gt_pred_b: Tensor,
    pub out_mask_ab: Option<OutMaskPair>,
    pub out_mask_ba: Option<OutMaskPair>,
    /// `fake * m + real_source * (1 - m)` composites for the in-mask discriminators.
    pub fake_b_mask: Option<Tensor>,
    pub fake_a_mask: Option<Tensor>,
}

pub struct SemanticStyleModel {
    g_vs: nn::VarStore,
    d_dec_vs: nn::VarStore,
    f_s_vs: nn::VarStore,
    g_a: LatentEncoder,
    g_b: LatentEncoder,
    dec_a: Decoder,
    dec_b: Decoder,
    d_dec_a: StyleDiscriminator,
    d_dec_b: StyleDiscriminator,
    f_s: SemanticClassifier,
    mask_discriminators: Option<MaskDiscriminators>,
    opt_g: nn::Optimizer,
    opt_f_s: nn::Optimizer,
    opt_d_dec: nn::Optimizer,
    criterion_gan: GanLoss,
    criterion_rec: ReconstructionLoss,
    criterion_out_mask: Option<OutMaskLoss>,
    g_reg: RegularizationSchedule,
    d_reg: RegularizationSchedule,
    fake_a_pool: ImagePool,
    fake_b_pool: ImagePool,
    mean_latent_a: Option<Tensor>,
    mean_latent_b: Option<Tensor>,
    reducer: Box<dyn Reducer>,
    config: TrainConfig,
    device: Device,
    niter: i64,
    mean_path_length_a: f64,
    mean_path_length_b: f64,
    mean_path_length_avg_a: f64,
    mean_path_length_avg_b: f64,
    last_f_s_loss: Option<f64>,
    input: Option<SemanticInput>,
    losses: Vec<(&'static str, f64)>,
    visuals: Vec<(&'static str, Tensor)>,
}

impl SemanticStyleModel {
    pub fn new(config: &TrainConfig) -> Result<Self> {
        Self::with_reducer(config, Box::new(LocalReducer))
    }

    pub fn with_reducer(config: &TrainConfig, reducer: Box<dyn Reducer>) -> Result<Self> {
        config.validate()?;
        config.validate_decoder_size()?;
        let device = config.device()?;
        let options = &config.semantic;
        let (input_nc, output_nc) = (config.input_nc, config.output_nc);
        let size = options.decoder_size;
        let wplus = options.wplus.then(|| latent_count(size));

        let mut g_vs = nn::VarStore::new(device);
        let root = g_vs.root();
        let g_a = LatentEncoder::new(
            &(&root / "g_a"),
            input_nc,
            config.ngf,
            config.n_blocks_g,
            size,
            options.latent_dim,
            wplus,
        )?;
        let g_b = LatentEncoder::new(
            &(&root / "g_b"),
            output_nc,
            config.ngf,
            config.n_blocks_g,
            size,
            options.latent_dim,
            wplus,
        )?;
        let dec_a = Decoder::new(
            &(&root / "dec_a"),
            size,
            options.latent_dim,
            options.decoder_channels,
            output_nc,
            options.mapping_layers,
        )?;
        let dec_b = Decoder::new(
            &(&root / "dec_b"),
            size,
            options.latent_dim,
            options.decoder_channels,
            input_nc,
            options.mapping_layers,
        )?;
        if let Some(weights) = &options.decoder_weights {
            for name in ["dec_a", "dec_b"] {
                let restored = checkpoint::load_network(&g_vs, name, weights)?;
                info!("loaded {} pretrained tensors into {} from {}", restored, name, weights.display());
            }
        }

        let (mean_latent_a, mean_latent_b) = if options.truncation < 1.0 {
            (
                Some(dec_a.mean_latent(TRUNCATION_SAMPLES)),
                Some(dec_b.mean_latent(TRUNCATION_SAMPLES)),
            )
        } else {
            (None, None)
        };

        let mut d_dec_vs = nn::VarStore::new(device);
        let root = d_dec_vs.root();
        let d_dec_a = StyleDiscriminator::new(&(&root / "d_dec_a"), size, input_nc, options.decoder_channels)?;
        let d_dec_b = StyleDiscriminator::new(&(&root / "d_dec_b"), size, output_nc, options.decoder_channels)?;

        let mut f_s_vs = nn::VarStore::new(device);
        let f_s = SemanticClassifier::new(
            &(f_s_vs.root() / "f_s"),
            input_nc,
            options.semantic_nclasses,
            options.f_s_nf,
        );

        let mask_discriminators = if options.disc_in_mask {
            let mut vs = nn::VarStore::new(device);
            let root = vs.root();
            let d_a = NLayerDiscriminator::new(&(&root / "d_a_mask"), output_nc, config.ndf, config.n_layers_d);
            let d_b = NLayerDiscriminator::new(&(&root / "d_b_mask"), input_nc, config.ndf, config.n_layers_d);
            let opt = nn::adam(config.beta1, 0.999, 0.).build(&vs, config.d_lr)?;
            vs.freeze();
            Some(MaskDiscriminators {
                vs,
                d_a,
                d_b,
                opt,
                fake_b_pool: ImagePool::new(config.pool_size),
                fake_a_pool: ImagePool::new(config.pool_size),
            })
        } else {
            None
        };

        let opt_g = nn::adam(config.beta1, 0.999, 0.).build(&g_vs, config.lr)?;
        let opt_f_s = nn::adam(config.beta1, 0.999, 0.).build(&f_s_vs, options.lr_f_s)?;
        let opt_d_dec = nn::adam(config.beta1, 0.999, 0.).build(&d_dec_vs, config.d_lr)?;
        g_vs.unfreeze();
        d_dec_vs.freeze();
        f_s_vs.freeze();

        let criterion_rec = if options.percept_loss {
            ReconstructionLoss::PerceptualMse(PerceptualLoss::new(
                device,
                options.vgg_weights.as_deref(),
                true,
            )?)
        } else {
            ReconstructionLoss::L1
        };
        let criterion_out_mask = options
            .out_mask
            .then(|| OutMaskLoss::new(options.loss_out_mask, options.charbonnier_eps));

        info!(
            "semantic StyleGAN2 model: size={} latent_dim={} wplus={} truncation={} disc_in_mask={} device={:?}",
            size, options.latent_dim, options.wplus, options.truncation, options.disc_in_mask, device
        );

        Ok(SemanticStyleModel {
            g_vs,
            d_dec_vs,
            f_s_vs,
            g_a,
            g_b,
            dec_a,
            dec_b,
            d_dec_a,
            d_dec_b,
            f_s,
            mask_discriminators,
            opt_g,
            opt_f_s,
            opt_d_dec,
            criterion_gan: GanLoss::new(config.gan_mode, config.real_label()),
            criterion_rec,
            criterion_out_mask,
            g_reg: RegularizationSchedule::new(options.g_reg_every),
            d_reg: RegularizationSchedule::new(options.d_reg_every),
            fake_a_pool: ImagePool::new(config.pool_size),
            fake_b_pool: ImagePool::new(config.pool_size),
            mean_latent_a,
            mean_latent_b,
            reducer,
            config: config.clone(),
            device,
            niter: 0,
            mean_path_length_a: 0.0,
            mean_path_length_b: 0.0,
            mean_path_length_avg_a: 0.0,
            mean_path_length_avg_b: 0.0,
            last_f_s_loss: None,
            input: None,
            losses: Vec::new(),
            visuals: Vec::new(),
        })
    }

    /// Completed training steps.
    pub fn step_count(&self) -> i64 {
        self.niter
    }

    /// Moving averages of the path lengths behind generated A and B images.
    pub fn mean_path_lengths(&self) -> (f64, f64) {
        (self.mean_path_length_a, self.mean_path_length_b)
    }

    /// Path-length averages reduced across processes.
    pub fn mean_path_length_averages(&self) -> (f64, f64) {
        (self.mean_path_length_avg_a, self.mean_path_length_avg_b)
    }

    pub fn last_classifier_loss(&self) -> Option<f64> {
        self.last_f_s_loss
    }

    pub fn image_paths(&self) -> &[PathBuf] {
        self.input.as_ref().map(|i| i.image_paths.as_slice()).unwrap_or(&[])
    }

    fn decode(&self, decoder: &Decoder, mean_latent: Option<&Tensor>, code: &Tensor) -> DecoderOutput {
        let options = DecodeOptions {
            input_is_latent: true,
            truncation: self.config.semantic.truncation,
            truncation_latent: mean_latent,
            randomize_noise: false,
        };
        decoder.decode(code, &options)
    }

    /// `B -> A` image through encoder B and decoder B.
    fn translate_ba(&self, xs: &Tensor) -> DecoderOutput {
        let code = self.g_b.forward_t(xs, true);
        self.decode(&self.dec_b, self.mean_latent_b.as_ref(), &code)
    }

    /// `A -> B` image through encoder A and decoder A.
    fn translate_ab(&self, xs: &Tensor) -> DecoderOutput {
        let code = self.g_a.forward_t(xs, true);
        self.decode(&self.dec_a, self.mean_latent_a.as_ref(), &code)
    }

    fn reconstruction_input(&self, fake: &Tensor) -> Tensor {
        if self.config.semantic.rec_noise {
            add_gaussian_noise(fake, NOISE_STDDEV)
        } else {
            fake.shallow_clone()
        }
    }

    fn discriminator_input(&self, xs: &Tensor) -> Tensor {
        if self.config.semantic.d_noise {
            add_gaussian_noise(xs, NOISE_STDDEV)
        } else {
            xs.shallow_clone()
        }
    }

    fn forward(&self, input: &SemanticInput) -> SemanticStyleStep {
        let DecoderOutput {
            image: fake_b,
            latents: latent_fake_b,
        } = self.translate_ab(&input.real_a);
        let rec_a = self.translate_ba(&self.reconstruction_input(&fake_b)).image;

        let DecoderOutput {
            image: fake_a,
            latents: latent_fake_a,
        } = self.translate_ba(&input.real_b);
        let rec_b = self.translate_ab(&self.reconstruction_input(&fake_a)).image;

        let gt_pred_b = tch::no_grad(|| self.f_s.forward_t(&input.real_b, true).argmax(1, false));
        let pred_fake_a = self.f_s.forward_t(&fake_a, true);
        let pred_fake_b = self.f_s.forward_t(&fake_b, true);

        let out_mask_ab = self.criterion_out_mask.map(|_| OutMaskPair {
            real: out_of_mask(&input.real_a, &input.label_a),
            fake: out_of_mask(&fake_b, &input.label_a),
        });
        let out_mask_ba = match (&self.criterion_out_mask, &input.label_b) {
            (Some(_), Some(label_b)) => Some(OutMaskPair {
                real: out_of_mask(&input.real_b, label_b),
                fake: out_of_mask(&fake_a, label_b),
            }),
            _ => None,
        };

        let (fake_b_mask, fake_a_mask) = match (&self.mask_discriminators, &input.label_b) {
            (Some(_), Some(label_b)) => (
                Some(in_mask(&fake_b, &input.label_a) + out_of_mask(&input.real_a, &input.label_a)),
                Some(in_mask(&fake_a, label_b) + out_of_mask(&input.real_b, label_b)),
            ),
            _ => (None, None),
        };

        SemanticStyleStep {
            fake_b,
            latent_fake_b,
            rec_a,
            fake_a,
            latent_fake_a,
            rec_b,
            pred_fake_a,
            pred_fake_b,
            gt_pred_b,
            out_mask_ab,
            out_mask_ba,
            fake_b_mask,
            fake_a_mask,
        }
    }

    /// Generator, decoder and regularization losses; returns the named values
    /// and the identity images when computed.
    fn backward_g(
        &mut self,
        input: &SemanticInput,
        step: &SemanticStyleStep,
    ) -> (Vec<(&'static str, f64)>, Option<(Tensor, Tensor)>) {
        let options = &self.config.semantic;
        let (lambda_a, lambda_b) = (self.config.lambda_a, self.config.lambda_b);
        let lambda_idt = self.config.lambda_identity;
        let mut losses = Vec::new();

        let (identities, loss_idt_a, loss_idt_b) = if lambda_idt > 0.0 {
            let idt_a = self.translate_ab(&input.real_b).image;
            let idt_b = self.translate_ba(&input.real_a).image;
            let loss_idt_a = self.criterion_rec.loss(&idt_a, &input.real_b) * (lambda_b * lambda_idt);
            let loss_idt_b = self.criterion_rec.loss(&idt_b, &input.real_a) * (lambda_a * lambda_idt);
            (Some((idt_a, idt_b)), loss_idt_a, loss_idt_b)
        } else {
            (None, zero_loss(self.device), zero_loss(self.device))
        };

        let loss_cycle_a = self.criterion_rec.loss(&step.rec_a, &input.real_a) * lambda_a;
        let loss_cycle_b = self.criterion_rec.loss(&step.rec_b, &input.real_b) * lambda_b;
        let mut loss_g = &loss_cycle_a + &loss_cycle_b + &loss_idt_a + &loss_idt_b;

        if let (Some(masks), Some(fake_b_mask), Some(fake_a_mask)) =
            (&self.mask_discriminators, &step.fake_b_mask, &step.fake_a_mask)
        {
            let loss_g_a_mask = self.criterion_gan.loss(&masks.d_a.forward_t(fake_b_mask, true), true);
            let loss_g_b_mask = self.criterion_gan.loss(&masks.d_b.forward_t(fake_a_mask, true), true);
            loss_g = loss_g + &loss_g_a_mask + &loss_g_b_mask;
            losses.push(("G_A_mask", scalar(&loss_g_a_mask)));
            losses.push(("G_B_mask", scalar(&loss_g_b_mask)));
        }

        let mut loss_sem_ab = semantic_cross_entropy(&step.pred_fake_b, &input.label_a);
        let mut loss_sem_ba = match &input.label_b {
            Some(label_b) => semantic_cross_entropy(&step.pred_fake_a, label_b),
            None => semantic_cross_entropy(&step.pred_fake_a, &step.gt_pred_b),
        };
        if !semantic_gate_open(self.last_f_s_loss) {
            loss_sem_ab = loss_sem_ab * 0.0;
            loss_sem_ba = loss_sem_ba * 0.0;
        }
        loss_g = loss_g + &loss_sem_ab + &loss_sem_ba;

        if let Some(criterion) = &self.criterion_out_mask {
            let zero = || zero_loss(self.device);
            let loss_out_mask_ab = step
                .out_mask_ab
                .as_ref()
                .map_or_else(zero, |pair| criterion.loss(&pair.real, &pair.fake) * options.lambda_out_mask);
            let loss_out_mask_ba = step
                .out_mask_ba
                .as_ref()
                .map_or_else(zero, |pair| criterion.loss(&pair.real, &pair.fake) * options.lambda_out_mask);
            loss_g = loss_g + &loss_out_mask_ab + &loss_out_mask_ba;
            losses.push(("out_mask_AB", scalar(&loss_out_mask_ab)));
            losses.push(("out_mask_BA", scalar(&loss_out_mask_ba)));
        }

        let compute_path = options.path_regularize != 0.0 && self.g_reg.is_due(self.niter);
        let path_weight = options.path_regularize * self.g_reg.every() as f64;

        let loss_g_nonsaturating_a = g_nonsaturating_loss(&self.d_dec_a.forward(&step.fake_a));
        let loss_g_nonsaturating_b = g_nonsaturating_loss(&self.d_dec_b.forward(&step.fake_b));

        let (loss_weighted_path_a, loss_weighted_path_b) = if compute_path {
            let path_a = g_path_regularize(
                &step.fake_a,
                &step.latent_fake_a,
                self.mean_path_length_a,
                PATH_LENGTH_DECAY,
            );
            let path_b = g_path_regularize(
                &step.fake_b,
                &step.latent_fake_b,
                self.mean_path_length_b,
                PATH_LENGTH_DECAY,
            );
            self.mean_path_length_a = path_a.mean_path_length;
            self.mean_path_length_b = path_b.mean_path_length;
            self.mean_path_length_avg_a = self.reducer.average(&Tensor::from(path_a.mean_path_length));
            self.mean_path_length_avg_b = self.reducer.average(&Tensor::from(path_b.mean_path_length));
            debug!(
                "path lengths A {:.4} B {:.4}",
                self.mean_path_length_avg_a, self.mean_path_length_avg_b
            );
            (path_a.penalty * path_weight, path_b.penalty * path_weight)
        } else {
            (zero_loss(self.device), zero_loss(self.device))
        };

        loss_g = loss_g
            + (&loss_g_nonsaturating_a + &loss_g_nonsaturating_b) * options.lambda_g
            + &loss_weighted_path_a
            + &loss_weighted_path_b;
        loss_g.backward();

        losses.extend([
            ("cycle_A", scalar(&loss_cycle_a)),
            ("idt_A", scalar(&loss_idt_a)),
            ("cycle_B", scalar(&loss_cycle_b)),
            ("idt_B", scalar(&loss_idt_b)),
            ("sem_AB", scalar(&loss_sem_ab)),
            ("sem_BA", scalar(&loss_sem_ba)),
            ("g_nonsaturating_A", scalar(&loss_g_nonsaturating_a)),
            ("g_nonsaturating_B", scalar(&loss_g_nonsaturating_b)),
            ("weighted_path_A", scalar(&loss_weighted_path_a)),
            ("weighted_path_B", scalar(&loss_weighted_path_b)),
        ]);
        (losses, identities)
    }

    /// In-mask discriminators, fed through their own image pools.
    fn optimize_mask_discriminators(&mut self, input: &SemanticInput, step: &SemanticStyleStep) -> Vec<(&'static str, f64)> {
        let criterion = self.criterion_gan;
        let (Some(masks), Some(fake_b_mask), Some(fake_a_mask)) =
            (self.mask_discriminators.as_mut(), &step.fake_b_mask, &step.fake_a_mask)
        else {
            return Vec::new();
        };

        masks.vs.unfreeze();
        masks.opt.zero_grad();
        let fake_b = masks.fake_b_pool.query(fake_b_mask);
        let loss_d_a_mask = backward_d_basic(&masks.d_a, &input.real_b, &fake_b, &criterion);
        let fake_a = masks.fake_a_pool.query(fake_a_mask);
        let loss_d_b_mask = backward_d_basic(&masks.d_b, &input.real_a, &fake_a, &criterion);
        masks.opt.step();
        masks.vs.freeze();

        vec![
            ("D_A_mask", scalar(&loss_d_a_mask)),
            ("D_B_mask", scalar(&loss_d_b_mask)),
        ]
    }

    fn optimize_classifier(&mut self, input: &SemanticInput) -> Result<f64> {
        self.f_s_vs.unfreeze();
        self.opt_f_s.zero_grad();
        let mut loss_f_s = semantic_cross_entropy(&self.f_s.forward_t(&input.real_a, true), &input.label_a);
        if self.config.semantic.train_f_s_b {
            let label_b = input
                .label_b
                .as_ref()
                .ok_or(MaskError::MissingLabel { domain: 'B' })?;
            loss_f_s = loss_f_s + semantic_cross_entropy(&self.f_s.forward_t(&input.real_b, true), label_b);
        }
        loss_f_s.backward();
        self.opt_f_s.step();
        self.f_s_vs.freeze();

        let value = scalar(&loss_f_s);
        self.last_f_s_loss = Some(value);
        Ok(value)
    }

    fn optimize_decoder_discriminators(&mut self, input: &SemanticInput, step: &SemanticStyleStep) -> Vec<(&'static str, f64)> {
        self.d_dec_vs.unfreeze();
        self.opt_d_dec.zero_grad();

        let real_a = self.discriminator_input(&input.real_a);
        let real_b = self.discriminator_input(&input.real_b);
        let fake_a = self.discriminator_input(&step.fake_a);
        let fake_b = self.discriminator_input(&step.fake_b);
        let fake_a = self.fake_a_pool.query(&fake_a);
        let fake_b = self.fake_b_pool.query(&fake_b);

        let loss_d_dec_a = d_logistic_loss(&self.d_dec_a.forward(&real_a), &self.d_dec_a.forward(&fake_a));
        let loss_d_dec_b = d_logistic_loss(&self.d_dec_b.forward(&real_b), &self.d_dec_b.forward(&fake_b));

        let (loss_d_dec_reg_a, loss_d_dec_reg_b) = if self.d_reg.is_due(self.niter) {
            let weight = self.config.semantic.r1 / 2.0 * self.d_reg.every() as f64;
            let r1 = |net: &StyleDiscriminator, real: &Tensor| {
                let real = real.detach().set_requires_grad(true);
                let pred = net.forward(&real);
                d_r1_loss(&pred, &real) * weight
            };
            (r1(&self.d_dec_a, &input.real_a), r1(&self.d_dec_b, &input.real_b))
        } else {
            (zero_loss(self.device), zero_loss(self.device))
        };

        let loss_d_dec = &loss_d_dec_a + &loss_d_dec_b + &loss_d_dec_reg_a + &loss_d_dec_reg_b;
        loss_d_dec.backward();
        self.opt_d_dec.step();
        self.d_dec_vs.freeze();

        vec![
            ("d_dec_A", scalar(&loss_d_dec_a)),
            ("d_dec_B", scalar(&loss_d_dec_b)),
            ("d_dec_reg_A", scalar(&loss_d_dec_reg_a)),
            ("d_dec_reg_B", scalar(&loss_d_dec_reg_b)),
        ]
    }

    fn loss_order(&self) -> Vec<&'static str> {
        let mut order = Vec::new();
        if self.mask_discriminators.is_some() {
            order.extend(["G_A_mask", "G_B_mask", "D_A_mask", "D_B_mask"]);
        }
        if self.criterion_out_mask.is_some() {
            order.extend(["out_mask_AB", "out_mask_BA"]);
        }
        order.extend([
            "cycle_A",
            "idt_A",
            "cycle_B",
            "idt_B",
            "sem_AB",
            "sem_BA",
            "f_s",
            "g_nonsaturating_A",
            "g_nonsaturating_B",
            "weighted_path_A",
            "weighted_path_B",
            "d_dec_A",
            "d_dec_B",
            "d_dec_reg_A",
            "d_dec_reg_B",
        ]);
        order
    }

    fn collect_visuals(
        &self,
        input: &SemanticInput,
        step: &SemanticStyleStep,
        identities: Option<(Tensor, Tensor)>,
    ) -> Vec<(&'static str, Tensor)> {
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

        let gt_pred_a = tch::no_grad(|| self.f_s.forward_t(&input.real_a, false).argmax(1, false));
        let mut visuals = visuals_a;
        visuals.extend(visuals_b);
        visuals.extend([
            ("input_A_label", label_visual(&input.label_a)),
            ("gt_pred_A", label_visual(&gt_pred_a)),
            ("pfB_max", label_visual(&step.pred_fake_b.detach().argmax(1, false))),
        ]);
        if let Some(label_b) = &input.label_b {
            visuals.push(("input_B_label", label_visual(label_b)));
        }
        visuals.extend([
            ("gt_pred_B", label_visual(&step.gt_pred_b)),
            ("pfA_max", label_visual(&step.pred_fake_a.detach().argmax(1, false))),
        ]);
        if let Some(pair) = &step.out_mask_ab {
            visuals.push(("real_A_out_mask", pair.real.shallow_clone()));
            visuals.push(("fake_B_out_mask", pair.fake.detach()));
        }
        if let Some(pair) = &step.out_mask_ba {
            visuals.push(("real_B_out_mask", pair.real.shallow_clone()));
            visuals.push(("fake_A_out_mask", pair.fake.detach()));
        }
        if let (Some(fake_b_mask), Some(fake_a_mask)) = (&step.fake_b_mask, &step.fake_a_mask) {
            visuals.push(("fake_B_mask", fake_b_mask.detach()));
            visuals.push(("fake_A_mask", fake_a_mask.detach()));
        }
        visuals
    }

    fn network_names(&self) -> Vec<&'static str> {
        let mut names = vec!["g_a", "g_b", "f_s", "dec_a", "dec_b", "d_dec_a", "d_dec_b"];
        if self.mask_discriminators.is_some() {
            names.extend(["d_a_mask", "d_b_mask"]);
        }
        names
    }

    fn store_of(&self, name: &str) -> Result<&nn::VarStore> {
        let vs = match name {
            "g_a" | "g_b" | "dec_a" | "dec_b" => &self.g_vs,
            "f_s" => &self.f_s_vs,
            "d_dec_a" | "d_dec_b" => &self.d_dec_vs,
            _ => {
                &self
                    .mask_discriminators
                    .as_ref()
                    .ok_or_else(|| anyhow!("no network named {}", name))?
                    .vs
            }
        };
        Ok(vs)
    }
}

fn loss_value(losses: &[(&'static str, f64)], name: &str) -> f64 {
    losses
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
        .unwrap_or(0.0)
}

impl TrainingModel for SemanticStyleModel {
    fn name(&self) -> &'static str {
        "semantic_mask_sty2"
    }

    fn set_input(&mut self, batch: Batch) -> Result<()> {
        let batch = batch.oriented(self.config.direction).to_device(self.device);
        let label_a = batch.label_a.ok_or(MaskError::MissingLabel { domain: 'A' })?;
        let semantic = &self.config.semantic;
        if (self.mask_discriminators.is_some() || semantic.train_f_s_b) && batch.label_b.is_none() {
            return Err(MaskError::MissingLabel { domain: 'B' }.into());
        }
        let size = self.config.semantic.decoder_size;
        let image = batch.a.size();
        ensure!(
            image[2] == size && image[3] == size,
            "images must be {}x{} to match the decoders, got {:?}",
            size,
            size,
            image
        );
        if self.config.direction == Direction::BtoA {
            debug!("training in the B to A direction");
        }

        self.input = Some(SemanticInput {
            real_a: batch.a,
            real_b: batch.b,
            label_a,
            label_b: batch.label_b,
            image_paths: batch.a_paths,
        });
        Ok(())
    }

    fn optimize_parameters(&mut self) -> Result<()> {
        let input = self
            .input
            .take()
            .ok_or_else(|| anyhow!("optimize_parameters called before set_input"))?;

        self.d_dec_vs.freeze();
        self.g_vs.unfreeze();
        let step = self.forward(&input);

        // encoders and decoders
        self.opt_g.zero_grad();
        let (g_losses, identities) = self.backward_g(&input, &step);
        self.opt_g.step();

        let mask_losses = self.optimize_mask_discriminators(&input, &step);

        let loss_f_s = self.optimize_classifier(&input)?;

        self.niter += 1;
        let d_losses = self.optimize_decoder_discriminators(&input, &step);

        let all: Vec<(&'static str, f64)> = g_losses
            .into_iter()
            .chain(mask_losses)
            .chain(std::iter::once(("f_s", loss_f_s)))
            .chain(d_losses)
            .collect();
        self.losses = self
            .loss_order()
            .into_iter()
            .map(|name| (name, loss_value(&all, name)))
            .collect();
        self.visuals = self.collect_visuals(&input, &step, identities);

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
        let mut written = Vec::new();
        for name in self.network_names() {
            written.extend(checkpoint::save_networks(self.store_of(name)?, &[name], dir, tag)?);
        }
        Ok(written)
    }

    fn load_networks(&mut self, dir: &Path, tag: &str) -> Result<()> {
        for name in self.network_names() {
            let path = dir.join(network_file_name(tag, name));
            let restored = checkpoint::load_network(self.store_of(name)?, name, &path)?;
            info!("loaded {} tensors into {} from {}", restored, name, path.display());
        }
        Ok(())
    }
}
