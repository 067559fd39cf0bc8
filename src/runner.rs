// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model runner: tokenize a composed prompt and call the backend's
//! generation.

use std::path::Path;

use candle_core::{Device, Tensor};

use crate::backend::{GenerationConfig, GenerationRequest};
use crate::error::{LensError, Result};
use crate::interp::logit_lens::HiddenStateStack;
use crate::options::LensOptions;
use crate::prompt::composer::{ComposedPrompt, compose_prompt};
use crate::state::ModelState;
use crate::tokenizer::LensTokenizer;
use crate::vision::pixels::{PixelBatch, load_pixel_batch};

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Prompt token ids as fed to the model.
    pub input_ids: Vec<u32>,
    /// Generated ids per beam, best beam first.
    pub sequences: Vec<Vec<u32>>,
    /// Step-zero hidden states, when requested.
    pub hidden_states: Option<HiddenStateStack>,
}

/// Attention mask over `ids`: 1 where the id is not `pad_id`.
///
/// # Shapes
/// - returns: `[1, ids.len()]`, `u32`
///
/// # Errors
///
/// Propagates tensor construction errors.
pub fn attention_mask(ids: &[u32], pad_id: Option<u32>, device: &Device) -> Result<Tensor> {
    let mask: Vec<u32> = ids
        .iter()
        .map(|&id| u32::from(pad_id != Some(id)))
        .collect();
    Ok(Tensor::new(mask.as_slice(), device)?.unsqueeze(0)?)
}

/// Run generation on already-tokenized ids.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] if `ids` is empty, and propagates
/// backend errors.
pub fn run_ids(
    state: &ModelState,
    pixels: Option<&PixelBatch>,
    ids: &[u32],
    config: &GenerationConfig,
    output_hidden_states: bool,
) -> Result<RunOutput> {
    if ids.is_empty() {
        return Err(LensError::Tokenizer("empty prompt".into()));
    }
    let input_ids = Tensor::new(ids, state.device())?.unsqueeze(0)?;
    let mask = attention_mask(ids, state.tokenizer().pad_token_id(), state.device())?;
    tracing::debug!(
        prompt_tokens = ids.len(),
        tiles = pixels.map_or(0, PixelBatch::num_tiles),
        output_hidden_states,
        "generate"
    );

    let output = state.model().generate(&GenerationRequest {
        pixel_values: pixels,
        input_ids: &input_ids,
        attention_mask: &mask,
        config,
        output_hidden_states,
    })?;

    if output_hidden_states && output.hidden_states.is_none() {
        return Err(LensError::Shape(
            "hidden states were requested but the backend returned none".into(),
        ));
    }
    Ok(RunOutput {
        input_ids: ids.to_vec(),
        sequences: output.sequences,
        hidden_states: output.hidden_states,
    })
}

/// Tokenize `prompt` (no special tokens added) and run generation.
///
/// The end-of-sequence id is the prompt's stop string looked up in the
/// vocabulary.
///
/// # Errors
///
/// Propagates tokenizer and backend errors.
pub fn run_model(
    state: &ModelState,
    pixels: Option<&PixelBatch>,
    prompt: &ComposedPrompt,
    options: &LensOptions,
    output_hidden_states: bool,
) -> Result<RunOutput> {
    let ids = state.tokenizer().encode_raw(&prompt.text)?;
    let eos = state.tokenizer().token_to_id(prompt.stop_str);
    if eos.is_none() {
        tracing::debug!(stop = prompt.stop_str, "stop string is not a single token");
    }
    run_ids(
        state,
        pixels,
        &ids,
        &options.generation_config(eos),
        output_hidden_states,
    )
}

/// Decode the best beam, cut at `stop_str` and trim.
///
/// # Errors
///
/// Propagates decoding errors.
pub fn decode_caption(
    tokenizer: &LensTokenizer,
    sequences: &[Vec<u32>],
    stop_str: &str,
) -> Result<String> {
    let Some(best) = sequences.first() else {
        return Ok(String::new());
    };
    let text = tokenizer.decode_skip_special(best)?;
    let text = text.split(stop_str).next().unwrap_or_default();
    Ok(text.trim().to_owned())
}

/// Compose the prompt for `pixels` using the options' template.
///
/// # Errors
///
/// Returns [`LensError::Config`] for an unknown template.
pub fn compose_for(
    state: &ModelState,
    pixels: &PixelBatch,
    options: &LensOptions,
) -> Result<ComposedPrompt> {
    let mut template = state.template(options.template.as_deref())?;
    if let Some(system) = &options.system_message {
        template.set_system_message(system.as_str());
    }
    let composed = compose_prompt(
        &template,
        &options.text_prompt,
        state.model().num_image_token(),
        pixels.num_tiles(),
    );
    tracing::debug!(
        template = template.name(),
        image_tokens = composed.image_token_count,
        "composed prompt"
    );
    Ok(composed)
}

/// Caption an image without collecting hidden states.
///
/// # Errors
///
/// Returns [`LensError::Decode`] if the image cannot be read, and
/// propagates tiling, tokenizer and backend errors.
pub fn caption_image(
    state: &ModelState,
    image_path: impl AsRef<Path>,
    options: &LensOptions,
) -> Result<String> {
    options.validate()?;
    let dtype = state.model().dtype();
    let pixels = load_pixel_batch(image_path, &options.tiling, state.device(), dtype)?;
    let prompt = compose_for(state, &pixels, options)?;
    let run = run_model(state, Some(&pixels), &prompt, options, false)?;
    decode_caption(state.tokenizer(), &run.sequences, prompt.stop_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
