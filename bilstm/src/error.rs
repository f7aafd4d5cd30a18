use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("failed to load weights {path}: {reason}")]
    Weights { path: PathBuf, reason: String },

    /// The record loaded but its tensors do not fit the configured model.
    #[error("weights {path} do not fit the model: {reason}")]
    IncompatibleWeights { path: PathBuf, reason: String },

    #[error("invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("failed to open image {path}")]
    ImageOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("sequence needs at least {required} usable images, got {retained}")]
    TooFewImages { retained: usize, required: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid label {token:?} on line {line}")]
    InvalidLabel { line: usize, token: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
