// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run parameters of the logit-lens pipeline.

use serde::Deserialize;

use crate::backend::GenerationConfig;
use crate::error::{LensError, Result};
use crate::prompt::DEFAULT_PROMPT;
use crate::tokenizer::SpecialTokenPolicy;
use crate::vision::tiling::TilingParams;

/// Explicit parameters of one pipeline call.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use candle_vlm_lens::LensOptions;
///
/// let opts = LensOptions::from_json(r#"{"temperature": 0.5, "tiling": {"max_tiles": 4}}"#).unwrap();
/// assert_eq!(opts.tiling.max_tiles, 4);
/// assert_eq!(opts.tiling.tile_size, 448);
/// assert_eq!(opts.max_new_tokens, 512);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LensOptions {
    /// User prompt; may contain an `<image>` placeholder.
    pub text_prompt: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Dynamic tiling parameters.
    pub tiling: TilingParams,
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
    /// Number of beams.
    pub num_beams: usize,
    /// How target class words are tokenized.
    pub class_policy: SpecialTokenPolicy,
    /// Conversation template overriding the model's own.
    pub template: Option<String>,
    /// System message overriding the template's default.
    pub system_message: Option<String>,
}

impl Default for LensOptions {
    fn default() -> Self {
        Self {
            text_prompt: DEFAULT_PROMPT.to_owned(),
            temperature: 1.0,
            tiling: TilingParams {
                max_tiles: 1,
                ..TilingParams::default()
            },
            max_new_tokens: 512,
            num_beams: 1,
            class_policy: SpecialTokenPolicy::Raw,
            template: None,
            system_message: None,
        }
    }
}

impl LensOptions {
    /// Parse options from JSON, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] on malformed JSON, unknown fields or
    /// invalid values.
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| LensError::Config(format!("parse options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for zero beams, zero new tokens, a
    /// negative or non-finite temperature, or an invalid tile range.
    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            return Err(LensError::Config("num_beams must be at least 1".into()));
        }
        if self.max_new_tokens == 0 {
            return Err(LensError::Config("max_new_tokens must be at least 1".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(LensError::Config(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        let t = &self.tiling;
        if t.tile_size == 0 || t.min_tiles == 0 || t.min_tiles > t.max_tiles {
            return Err(LensError::Config(format!(
                "invalid tiling: size {}, tiles [{}, {}]",
                t.tile_size, t.min_tiles, t.max_tiles
            )));
        }
        Ok(())
    }

    /// Generation parameters for an image-conditioned run.
    #[must_use]
    pub fn generation_config(&self, eos_token_id: Option<u32>) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            num_beams: self.num_beams,
            max_new_tokens: self.max_new_tokens,
            eos_token_id,
            use_cache: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
