use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("label mask of batch item {index} has no foreground pixel")]
    EmptyMask { index: i64 },

    #[error("domain {domain} requires a label map but none was provided")]
    MissingLabel { domain: char },

    #[error("label shape {label:?} does not match image shape {image:?}")]
    ShapeMismatch { image: Vec<i64>, label: Vec<i64> },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("identity loss needs input_nc == output_nc (got {input_nc} and {output_nc})")]
    IdentityChannelMismatch { input_nc: i64, output_nc: i64 },

    #[error("{name} must be at least 1")]
    InvalidInterval { name: &'static str },

    #[error("truncation must lie in (0, 1], got {0}")]
    InvalidTruncation(f64),

    #[error("decoder size must be a power of two >= 8 matching crop_size (decoder {decoder_size}, crop {crop_size})")]
    InvalidDecoderSize { decoder_size: i64, crop_size: i64 },

    #[error("percept_loss needs pretrained VGG16 weights (set vgg_weights)")]
    MissingVggWeights,

    #[error("unknown loss kind `{0}`")]
    UnknownLossKind(String),
}
