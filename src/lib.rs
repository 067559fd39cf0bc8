// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-vlm-lens
//!
//! Logit-lens confidence probing for InternVL-style vision-language
//! models, built on [candle](https://github.com/huggingface/candle).
//!
//! The crate tiles an image, composes the image-conditioned chat prompt,
//! asks a model backend for a caption together with the hidden states of
//! every layer at the first generation step, and projects each layer
//! through the vocabulary head. The per-layer, per-image-token
//! probabilities of a target class word are then reduced to a scalar
//! confidence, a `[position, layer]` heatmap and a square segmentation
//! grid.
//!
//! ## Model boundary
//!
//! Generation itself (vision tower, attention, sampling) is provided by a
//! [`VlmBackend`] implementation. [`LensHead`] loads the vocabulary head
//! and embedding table from safetensors, so a backend can delegate
//! [`VlmBackend::project_to_vocab`] and [`VlmBackend::embed_tokens`] to it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use candle_vlm_lens::{LensOptions, ModelState, VlmModel, analyze_class, retrieve_logit_lens};
//!
//! # fn run(model: VlmModel, tokenizer: candle_vlm_lens::LensTokenizer) -> candle_vlm_lens::Result<()> {
//! let state = ModelState::new(model, tokenizer, "OpenGVLab/InternVL2_5-1B")?;
//! let options = LensOptions::default();
//! let report = retrieve_logit_lens(&state, "cat.jpg", &options)?;
//! let scored = analyze_class(&state, &report, "cat", &options)?;
//! println!("{}: {:.3}", report.caption, scored.confidence);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod download;
pub mod error;
pub mod head;
pub mod hooks;
pub mod interp;
pub mod options;
pub mod pipeline;
pub mod prompt;
pub mod runner;
pub mod state;
pub mod tokenizer;
pub mod vision;

// --- Public re-exports ---------------------------------------------------

// Backend
pub use backend::{GenerationConfig, GenerationOutput, GenerationRequest, VlmBackend, VlmModel};

// Config
pub use config::{LlmFamily, VisionLanguageConfig};
pub use options::LensOptions;

// Download
pub use download::{ModelFiles, fetch_model_files, local_model_files};

// Error
pub use error::{LensError, Result};

// Head and state
pub use head::LensHead;
pub use state::ModelState;

// Hooks
pub use hooks::{HookFn, HookHandle, HookPoint, HookRegistry};

// Interpretability
pub use interp::alignment::{ImageTokenSpan, locate_image_span};
pub use interp::confidence::{
    ClassTokens, ConfidenceGrid, ConfidenceHeatmap, ConfidenceReport, confidence_heatmap,
    confidence_segmentation, internal_confidence,
};
pub use interp::logit_lens::{HiddenStateStack, LayerProbabilities, TokenPrediction};

// Pipeline
pub use pipeline::{LogitLensReport, analyze_class, retrieve_logit_lens};
pub use runner::{RunOutput, caption_image};

// Prompt
pub use prompt::composer::{ComposedPrompt, compose_prompt};
pub use prompt::conversation::ConversationTemplate;

// Tokenizer
pub use tokenizer::{LensTokenizer, SpecialTokenPolicy};

// Vision
pub use vision::pixels::{PixelBatch, load_image};
pub use vision::tiling::{TileGrid, TilingParams, dynamic_preprocess};
