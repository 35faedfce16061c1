//! Mask-aware CycleGAN and semantic StyleGAN2 CycleGAN training on libtorch.

pub mod blur;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod data;
pub mod discriminator;
pub mod dist;
pub mod encoder;
pub mod error;
pub mod generator;
pub mod image_pool;
pub mod instance_norm;
pub mod losses;
pub mod mapping_network;
pub mod mask;
pub mod models;
pub mod noise_injection;
pub mod ops;
pub mod perceptual;
pub mod regularizers;
pub mod residual_block;
pub mod resnet_generator;
pub mod style_discriminator;
pub mod style_layer;

pub use config::TrainConfig;
pub use error::{ConfigError, MaskError};
pub use models::{create_model, ModelKind, TrainingModel};
