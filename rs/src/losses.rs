//! Loss criteria shared by the training models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Reduction, Tensor};

use crate::error::ConfigError;
use crate::perceptual::PerceptualLoss;

/// Adversarial objective used by the CycleGAN-style discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GanMode {
    /// Least squares against the target label.
    Lsgan,
    /// Binary cross-entropy on logits.
    Vanilla,
    /// Wasserstein critic, `-mean` for real and `mean` for fake.
    Wgangp,
}

#[derive(Debug, Clone, Copy)]
pub struct GanLoss {
    mode: GanMode,
    real_label: f64,
    fake_label: f64,
}

impl GanLoss {
    pub fn new(mode: GanMode, real_label: f64) -> Self {
        GanLoss {
            mode,
            real_label,
            fake_label: 0.0,
        }
    }

    pub fn loss(&self, prediction: &Tensor, target_is_real: bool) -> Tensor {
        let label = if target_is_real {
            self.real_label
        } else {
            self.fake_label
        };
        match self.mode {
            GanMode::Lsgan => {
                let target = prediction.ones_like() * label;
                prediction.mse_loss(&target, Reduction::Mean)
            }
            GanMode::Vanilla => {
                let target = prediction.ones_like() * label;
                prediction.binary_cross_entropy_with_logits::<Tensor>(
                    &target,
                    None,
                    None,
                    Reduction::Mean,
                )
            }
            GanMode::Wgangp => {
                if target_is_real {
                    -prediction.mean(Kind::Float)
                } else {
                    prediction.mean(Kind::Float)
                }
            }
        }
    }
}

/// Distance used by the cycle and identity terms.
#[derive(Debug)]
pub enum ReconstructionLoss {
    L1,
    /// VGG feature distance plus pixel MSE.
    PerceptualMse(PerceptualLoss),
}

impl ReconstructionLoss {
    pub fn loss(&self, input: &Tensor, target: &Tensor) -> Tensor {
        match self {
            ReconstructionLoss::L1 => input.l1_loss(target, Reduction::Mean),
            ReconstructionLoss::PerceptualMse(perceptual) => {
                perceptual.loss(input, target) + input.mse_loss(target, Reduction::Mean)
            }
        }
    }
}

/// Name of an out-of-mask criterion as written in a config file
/// (`"L1"`, `"MSE"` or `"Charbonnier"`, case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutMaskLossKind {
    L1,
    Mse,
    Charbonnier,
}

impl FromStr for OutMaskLossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(OutMaskLossKind::L1),
            "mse" => Ok(OutMaskLossKind::Mse),
            "charbonnier" => Ok(OutMaskLossKind::Charbonnier),
            _ => Err(ConfigError::UnknownLossKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for OutMaskLossKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for OutMaskLossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutMaskLossKind::L1 => "L1",
            OutMaskLossKind::Mse => "MSE",
            OutMaskLossKind::Charbonnier => "Charbonnier",
        };
        f.write_str(name)
    }
}

impl From<OutMaskLossKind> for String {
    fn from(kind: OutMaskLossKind) -> Self {
        kind.to_string()
    }
}

/// Criterion comparing the out-of-mask regions of a real and a fake image.
#[derive(Debug, Clone, Copy)]
pub enum OutMaskLoss {
    L1,
    Mse,
    Charbonnier { eps: f64 },
}

impl OutMaskLoss {
    pub fn new(kind: OutMaskLossKind, charbonnier_eps: f64) -> Self {
        match kind {
            OutMaskLossKind::L1 => OutMaskLoss::L1,
            OutMaskLossKind::Mse => OutMaskLoss::Mse,
            OutMaskLossKind::Charbonnier => OutMaskLoss::Charbonnier {
                eps: charbonnier_eps,
            },
        }
    }

    pub fn loss(&self, input: &Tensor, target: &Tensor) -> Tensor {
        match *self {
            OutMaskLoss::L1 => input.l1_loss(target, Reduction::Mean),
            OutMaskLoss::Mse => input.mse_loss(target, Reduction::Mean),
            OutMaskLoss::Charbonnier { eps } => {
                ((input - target).square() + eps).sqrt().mean(Kind::Float)
            }
        }
    }
}

/// Pixel-wise cross-entropy of `[N, C, H, W]` logits against `[N, H, W]` class ids.
pub fn semantic_cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.cross_entropy_loss::<Tensor>(labels, None, Reduction::Mean, -100, 0.0)
}

/// A 0-dim zero on `device`, for loss terms that are switched off.
pub fn zero_loss(device: Device) -> Tensor {
    Tensor::zeros([1], (Kind::Float, device)).sum(Kind::Float)
}
