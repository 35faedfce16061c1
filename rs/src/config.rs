//! Training options, read from a JSON file where every field is optional.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::error::ConfigError;
use crate::losses::{GanMode, OutMaskLossKind};

/// Which domain is the source of the translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "AtoB")]
    AtoB,
    #[serde(rename = "BtoA")]
    BtoA,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lr: f64,
    pub beta1: f64,
    /// Learning rate of the decoder discriminators.
    pub d_lr: f64,
    pub batch_size: i64,
    pub input_nc: i64,
    pub output_nc: i64,
    pub ngf: i64,
    pub ndf: i64,
    pub n_layers_d: i64,
    pub n_blocks_g: i64,
    pub dropout: bool,
    pub gan_mode: GanMode,
    pub pool_size: usize,
    pub lambda_a: f64,
    pub lambda_b: f64,
    pub lambda_identity: f64,
    pub d_label_smooth: bool,
    pub direction: Direction,
    pub crop_size: i64,
    /// `auto`, `cpu`, `cuda` or `cuda:N`.
    pub device: String,
    pub mask_patch: MaskPatchOptions,
    pub semantic: SemanticOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskPatchOptions {
    pub use_disc_patch: bool,
    /// Generators also see the out-of-mask image.
    pub use_context_g: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticOptions {
    pub semantic_nclasses: i64,
    /// Width of the semantic classifier.
    pub f_s_nf: i64,
    pub lambda_g: f64,
    pub out_mask: bool,
    pub lambda_out_mask: f64,
    pub loss_out_mask: OutMaskLossKind,
    pub charbonnier_eps: f64,
    pub disc_in_mask: bool,
    pub train_f_s_b: bool,
    pub lr_f_s: f64,
    pub d_noise: bool,
    pub rec_noise: bool,
    pub wplus: bool,
    pub truncation: f64,
    pub decoder_size: i64,
    pub latent_dim: i64,
    pub decoder_channels: i64,
    pub mapping_layers: i64,
    pub d_reg_every: i64,
    pub g_reg_every: i64,
    pub r1: f64,
    pub path_regularize: f64,
    pub percept_loss: bool,
    pub vgg_weights: Option<PathBuf>,
    pub decoder_weights: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            lr: 0.0002,
            beta1: 0.5,
            d_lr: 0.0001,
            batch_size: 1,
            input_nc: 3,
            output_nc: 3,
            ngf: 64,
            ndf: 64,
            n_layers_d: 3,
            n_blocks_g: 9,
            dropout: false,
            gan_mode: GanMode::Lsgan,
            pool_size: 50,
            lambda_a: 10.0,
            lambda_b: 10.0,
            lambda_identity: 0.5,
            d_label_smooth: false,
            direction: Direction::AtoB,
            crop_size: 256,
            device: "auto".to_string(),
            mask_patch: MaskPatchOptions::default(),
            semantic: SemanticOptions::default(),
        }
    }
}

impl Default for SemanticOptions {
    fn default() -> Self {
        SemanticOptions {
            semantic_nclasses: 10,
            f_s_nf: 32,
            lambda_g: 1.0,
            out_mask: false,
            lambda_out_mask: 10.0,
            loss_out_mask: OutMaskLossKind::L1,
            charbonnier_eps: 1e-6,
            disc_in_mask: false,
            train_f_s_b: false,
            lr_f_s: 0.0002,
            d_noise: false,
            rec_noise: false,
            wplus: false,
            truncation: 1.0,
            decoder_size: 256,
            latent_dim: 512,
            decoder_channels: 512,
            mapping_layers: 8,
            d_reg_every: 16,
            g_reg_every: 4,
            r1: 10.0,
            path_regularize: 2.0,
            percept_loss: false,
            vgg_weights: None,
            decoder_weights: None,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lambda_identity > 0.0 && self.input_nc != self.output_nc {
            return Err(ConfigError::IdentityChannelMismatch {
                input_nc: self.input_nc,
                output_nc: self.output_nc,
            });
        }
        if self.semantic.d_reg_every < 1 {
            return Err(ConfigError::InvalidInterval { name: "d_reg_every" });
        }
        if self.semantic.g_reg_every < 1 {
            return Err(ConfigError::InvalidInterval { name: "g_reg_every" });
        }
        let truncation = self.semantic.truncation;
        if !(truncation > 0.0 && truncation <= 1.0) {
            return Err(ConfigError::InvalidTruncation(truncation));
        }
        if self.semantic.percept_loss && self.semantic.vgg_weights.is_none() {
            return Err(ConfigError::MissingVggWeights);
        }
        Ok(())
    }

    /// The StyleGAN2 decoders produce images at the crop resolution.
    pub fn validate_decoder_size(&self) -> Result<(), ConfigError> {
        let size = self.semantic.decoder_size;
        let power_of_two = size >= 8 && (size & (size - 1)) == 0;
        if !power_of_two || size != self.crop_size {
            return Err(ConfigError::InvalidDecoderSize {
                decoder_size: size,
                crop_size: self.crop_size,
            });
        }
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        let device = match self.device.as_str() {
            "auto" => Device::cuda_if_available(),
            "cpu" => Device::Cpu,
            "cuda" => Device::Cuda(0),
            other => match other.strip_prefix("cuda:") {
                Some(index) => Device::Cuda(
                    index
                        .parse()
                        .with_context(|| format!("invalid cuda device `{}`", other))?,
                ),
                None => bail!("unknown device `{}`", other),
            },
        };
        Ok(device)
    }

    pub fn real_label(&self) -> f64 {
        if self.d_label_smooth {
            0.9
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_gives_defaults() {
        let config: TrainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.lr, 0.0002);
        assert_eq!(config.direction, Direction::AtoB);
        assert_eq!(config.semantic.d_reg_every, 16);
        assert_eq!(config.semantic.loss_out_mask, OutMaskLossKind::L1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"direction": "BtoA", "gan_mode": "vanilla",
                "semantic": {{"loss_out_mask": "Charbonnier", "truncation": 0.7}}}}"#
        )
        .unwrap();
        let config = TrainConfig::load(file.path()).unwrap();
        assert_eq!(config.direction, Direction::BtoA);
        assert_eq!(config.gan_mode, GanMode::Vanilla);
        assert_eq!(config.semantic.loss_out_mask, OutMaskLossKind::Charbonnier);
        assert_eq!(config.semantic.truncation, 0.7);
        assert_eq!(config.semantic.g_reg_every, 4);
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let config = TrainConfig {
            output_nc: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IdentityChannelMismatch { .. })
        ));

        let mut config = TrainConfig::default();
        config.semantic.d_reg_every = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval { name: "d_reg_every" })
        ));

        let mut config = TrainConfig::default();
        config.semantic.truncation = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTruncation(_))));

        let mut config = TrainConfig::default();
        config.semantic.percept_loss = true;
        assert!(matches!(config.validate(), Err(ConfigError::MissingVggWeights)));
        config.semantic.vgg_weights = Some(PathBuf::from("vgg16.ot"));
        assert!(config.validate().is_ok());

        let mut config = TrainConfig::default();
        config.crop_size = 128;
        assert!(matches!(
            config.validate_decoder_size(),
            Err(ConfigError::InvalidDecoderSize { .. })
        ));
    }

    #[test]
    fn unknown_loss_kind_fails_to_parse() {
        let result: Result<TrainConfig, _> =
            serde_json::from_str(r#"{"semantic": {"loss_out_mask": "huber"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn parses_devices() {
        let mut config = TrainConfig::default();
        config.device = "cpu".into();
        assert_eq!(config.device().unwrap(), Device::Cpu);
        config.device = "cuda:1".into();
        assert_eq!(config.device().unwrap(), Device::Cuda(1));
        config.device = "tpu".into();
        assert!(config.device().is_err());
    }
}
