// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-vlm-lens.

/// Errors that can occur while probing a vision-language model.
#[derive(Debug, thiserror::Error)]
pub enum LensError {
    /// Tensor operation or model call failure (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// The input image could not be read or decoded.
    #[error("image decode error: {0}")]
    Decode(String),

    /// The image-context token run in the prompt does not match the tiling.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// A tensor does not have the expected rank, axis sizes, or grid shape.
    #[error("shape error: {0}")]
    Shape(String),

    /// Hook registration or dispatch error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Model configuration or option error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model file resolution or download error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-vlm-lens operations.
pub type Result<T> = std::result::Result<T, LensError>;
