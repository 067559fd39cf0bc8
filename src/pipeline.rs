// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end logit-lens retrieval and class scoring.
//!
//! [`retrieve_logit_lens`] tiles an image, generates a caption with
//! step-zero hidden states, slices them to the image-token span and
//! projects every layer to vocabulary probabilities. [`analyze_class`]
//! then scores a target class on the result.

use std::path::Path;

use image::DynamicImage;

use crate::error::{LensError, Result};
use crate::interp::alignment::{ImageTokenSpan, locate_image_span};
use crate::interp::confidence::{ClassTokens, ConfidenceReport};
use crate::interp::logit_lens::LayerProbabilities;
use crate::options::LensOptions;
use crate::runner::{compose_for, decode_caption, run_model};
use crate::state::ModelState;
use crate::vision::pixels::{load_image, pixel_batch_from_image};

/// Caption and image-span probabilities of one image.
#[derive(Debug, Clone)]
pub struct LogitLensReport {
    /// Generated caption, special tokens removed.
    pub caption: String,
    /// Prompt token ids fed to the model.
    pub input_ids: Vec<u32>,
    /// Image-context span inside `input_ids`.
    pub span: ImageTokenSpan,
    /// Number of image tiles, thumbnail included.
    pub num_tiles: usize,
    /// `[beam, layer, position, vocab]` over the image span only.
    pub probabilities: LayerProbabilities,
}

/// Caption an image file and collect its logit-lens probabilities.
///
/// # Errors
///
/// Returns [`LensError::Decode`] if the image cannot be read,
/// [`LensError::Alignment`] if the prompt's image-token run does not match
/// the tiling, [`LensError::Shape`] if the backend's hidden states do not
/// cover the prompt, and propagates model errors.
pub fn retrieve_logit_lens(
    state: &ModelState,
    image_path: impl AsRef<Path>,
    options: &LensOptions,
) -> Result<LogitLensReport> {
    let image = load_image(image_path)?;
    retrieve_logit_lens_from_image(state, &image, options)
}

/// [`retrieve_logit_lens`] for an already decoded image.
///
/// # Errors
///
/// See [`retrieve_logit_lens`].
pub fn retrieve_logit_lens_from_image(
    state: &ModelState,
    image: &DynamicImage,
    options: &LensOptions,
) -> Result<LogitLensReport> {
    options.validate()?;
    let model = state.model();

    // --- Tile and compose ---
    let pixels = pixel_batch_from_image(image, &options.tiling, state.device(), model.dtype())?;
    let prompt = compose_for(state, &pixels, options)?;

    // --- Generate with step-zero hidden states ---
    let run = run_model(state, Some(&pixels), &prompt, options, true)?;
    let caption = decode_caption(state.tokenizer(), &run.sequences, prompt.stop_str)?;
    tracing::info!(caption = %caption, "generated caption");

    let stack = run
        .hidden_states
        .ok_or_else(|| LensError::Shape("backend returned no hidden states".into()))?;
    if stack.seq_len() != run.input_ids.len() {
        return Err(LensError::Shape(format!(
            "hidden states cover {} positions, prompt has {}",
            stack.seq_len(),
            run.input_ids.len()
        )));
    }

    // --- Align, slice, project ---
    let span = locate_image_span(
        &run.input_ids,
        state.image_context_id()?,
        prompt.image_token_count,
    )?;
    let probabilities = model.logit_lens(&stack.narrow_positions(span)?)?;

    Ok(LogitLensReport {
        caption,
        input_ids: run.input_ids,
        span,
        num_tiles: pixels.num_tiles(),
        probabilities,
    })
}

/// Score `class` on a logit-lens report.
///
/// The class is tokenized with the policy in `options`.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if the class cannot be tokenized under
/// the policy, and [`LensError::Shape`] if the image span does not form a
/// square grid.
pub fn analyze_class(
    state: &ModelState,
    report: &LogitLensReport,
    class: &str,
    options: &LensOptions,
) -> Result<ConfidenceReport> {
    let tokens = ClassTokens::resolve(state.tokenizer(), class, options.class_policy)?;
    let scored = ConfidenceReport::compute(&report.probabilities, &tokens)?;
    tracing::info!(class, confidence = scored.confidence, "scored class");
    Ok(scored)
}
