// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vision-language model configuration and `HuggingFace` `config.json` parsing.
//!
//! [`VisionLanguageConfig`] captures what the lens pipeline needs to know
//! about an InternVL-style chat checkpoint: the conversation template, how
//! many image-context tokens one tile expands to, the dynamic tiling limits,
//! and the language model's dimensions and tensor naming.
//!
//! # Usage
//!
//! ```
//! use candle_vlm_lens::VisionLanguageConfig;
//!
//! let json = serde_json::json!({
//!     "model_type": "internvl_chat",
//!     "template": "internvl2_5",
//!     "downsample_ratio": 0.5,
//!     "force_image_size": 448,
//!     "vision_config": { "image_size": 448, "patch_size": 14 },
//!     "llm_config": {
//!         "architectures": ["Qwen2ForCausalLM"],
//!         "hidden_size": 896, "num_hidden_layers": 24, "vocab_size": 151674
//!     }
//! });
//! let config = VisionLanguageConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_image_token, 256);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// LlmFamily
// ---------------------------------------------------------------------------

/// Language-model family behind the vision encoder.
///
/// Determines where the token embedding table and the vocabulary head live
/// in the checkpoint.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmFamily {
    /// `Qwen2ForCausalLM` (InternVL 2.5 1B/4B/38B/78B).
    Qwen2,
    /// `InternLM2ForCausalLM` (InternVL 2.5 8B/26B).
    InternLm2,
    /// `LlamaForCausalLM` and other `model.embed_tokens` / `lm_head` layouts.
    Llama,
}

impl LlmFamily {
    /// Map a `HuggingFace` architecture name to a family.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for architectures with unknown layout.
    pub fn from_architecture(arch: &str) -> Result<Self> {
        match arch {
            "Qwen2ForCausalLM" => Ok(Self::Qwen2),
            "InternLM2ForCausalLM" => Ok(Self::InternLm2),
            "LlamaForCausalLM" | "Phi3ForCausalLM" => Ok(Self::Llama),
            other => Err(LensError::Config(format!(
                "unsupported language model architecture: '{other}'"
            ))),
        }
    }

    /// Checkpoint name of the token embedding table, relative to `language_model`.
    #[must_use]
    pub const fn embedding_tensor(self) -> &'static str {
        match self {
            Self::Qwen2 | Self::Llama => "model.embed_tokens.weight",
            Self::InternLm2 => "model.tok_embeddings.weight",
        }
    }

    /// Checkpoint name of the vocabulary head, relative to `language_model`.
    #[must_use]
    pub const fn head_tensor(self) -> &'static str {
        match self {
            Self::Qwen2 | Self::Llama => "lm_head.weight",
            Self::InternLm2 => "output.weight",
        }
    }
}

impl fmt::Display for LlmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qwen2 => write!(f, "Qwen2"),
            Self::InternLm2 => write!(f, "InternLM2"),
            Self::Llama => write!(f, "LLaMA"),
        }
    }
}

// ---------------------------------------------------------------------------
// VisionLanguageConfig
// ---------------------------------------------------------------------------

/// Configuration of an InternVL-style chat checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionLanguageConfig {
    // --- Prompting -----------------------------------------------------------
    /// Conversation template name (e.g. `"internvl2_5"`).
    pub template: String,
    /// Image-context tokens produced per tile:
    /// `(image_size / patch_size)^2 * downsample_ratio^2`.
    pub num_image_token: usize,

    // --- Vision --------------------------------------------------------------
    /// Tile edge in pixels.
    pub image_size: usize,
    /// Vision-encoder patch edge in pixels.
    pub patch_size: usize,
    /// Pixel-shuffle downsampling ratio.
    pub downsample_ratio: f64,
    /// Lower bound on dynamic tiles.
    pub min_dynamic_patch: usize,
    /// Upper bound on dynamic tiles.
    pub max_dynamic_patch: usize,
    /// Whether a full-image thumbnail tile is appended.
    pub use_thumbnail: bool,

    // --- Language model ------------------------------------------------------
    /// Language-model family (tensor naming).
    pub llm_family: LlmFamily,
    /// Hidden dimension of the language model.
    pub hidden_size: usize,
    /// Number of decoder blocks.
    pub num_layers: usize,
    /// Vocabulary size (rows of the vocabulary head).
    pub vocab_size: usize,
    /// Whether the vocabulary head shares weights with the embedding table.
    pub tie_word_embeddings: bool,
}

impl VisionLanguageConfig {
    /// Parse a [`VisionLanguageConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `model_type` is not `internvl_chat`
    /// or if required fields are missing.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'model_type' field".into()))?;
        if model_type != "internvl_chat" {
            return Err(LensError::Config(format!(
                "unsupported model_type: '{model_type}'"
            )));
        }

        let template = config
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'template' field".into()))?
            .to_owned();

        let vision = config
            .get("vision_config")
            .ok_or_else(|| LensError::Config("missing 'vision_config' object".into()))?;
        let llm = config
            .get("llm_config")
            .ok_or_else(|| LensError::Config("missing 'llm_config' object".into()))?;

        // `force_image_size` overrides the vision tower's native size.
        let image_size = get_optional_usize(config, "force_image_size")
            .map_or_else(|| get_usize(vision, "image_size"), Ok)?;
        let patch_size = get_usize(vision, "patch_size")?;
        let downsample_ratio = get_f64_or(config, "downsample_ratio", 0.5);
        let num_image_token = compute_num_image_token(image_size, patch_size, downsample_ratio)?;

        let arch = llm
            .get("architectures")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'llm_config.architectures'".into()))?;

        Ok(Self {
            template,
            num_image_token,

            image_size,
            patch_size,
            downsample_ratio,
            min_dynamic_patch: get_usize_or(config, "min_dynamic_patch", 1),
            max_dynamic_patch: get_usize_or(config, "max_dynamic_patch", 12),
            use_thumbnail: get_bool_or(config, "use_thumbnail", false),

            llm_family: LlmFamily::from_architecture(arch)?,
            hidden_size: get_usize(llm, "hidden_size")?,
            num_layers: get_usize(llm, "num_hidden_layers")?,
            vocab_size: get_usize(llm, "vocab_size")?,
            tie_word_embeddings: get_bool_or(llm, "tie_word_embeddings", false),
        })
    }
}

/// Image-context tokens per tile after pixel shuffle.
///
/// # Errors
///
/// Returns [`LensError::Config`] if `patch_size` is zero, the ratio is not
/// in `(0, 1]`, or the product is not a whole number of tokens.
pub fn compute_num_image_token(
    image_size: usize,
    patch_size: usize,
    downsample_ratio: f64,
) -> Result<usize> {
    if patch_size == 0 || image_size % patch_size != 0 {
        return Err(LensError::Config(format!(
            "image_size {image_size} is not a multiple of patch_size {patch_size}"
        )));
    }
    if !(downsample_ratio > 0.0 && downsample_ratio <= 1.0) {
        return Err(LensError::Config(format!(
            "downsample_ratio {downsample_ratio} outside (0, 1]"
        )));
    }
    let grid = image_size / patch_size;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    // PROMOTE: patch grids are tiny (< 2^20), exact in f64
    let side = grid as f64 * downsample_ratio;
    if (side - side.round()).abs() > 1e-9 {
        return Err(LensError::Config(format!(
            "patch grid {grid} does not downsample evenly by {downsample_ratio}"
        )));
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    // CAST: side is a small, positive whole number checked above
    let side = side.round() as usize;
    Ok(side * side)
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LensError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| LensError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
