// SPDX-License-Identifier: MIT OR Apache-2.0

//! Weave the image-token block into a user prompt and wrap it in a template.

use super::conversation::ConversationTemplate;
use super::{IMAGE_PLACEHOLDER, IMG_CONTEXT_TOKEN, IMG_END_TOKEN, IMG_START_TOKEN};

/// A fully rendered prompt and the size of its image-context run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    /// Prompt string ready for tokenization (no special tokens added).
    pub text: String,
    /// Number of `<IMG_CONTEXT>` tokens in `text`.
    pub image_token_count: usize,
    /// Generation stop marker of the template.
    pub stop_str: &'static str,
}

/// The `<img>…</img>` block for `num_tiles` tiles.
#[must_use]
pub fn image_token_block(tokens_per_tile: usize, num_tiles: usize) -> String {
    let count = tokens_per_tile * num_tiles;
    let mut block =
        String::with_capacity(IMG_START_TOKEN.len() + IMG_END_TOKEN.len() + count * IMG_CONTEXT_TOKEN.len());
    block.push_str(IMG_START_TOKEN);
    block.push_str(&IMG_CONTEXT_TOKEN.repeat(count));
    block.push_str(IMG_END_TOKEN);
    block
}

/// Build the final prompt for one image and one user message.
///
/// The image block replaces the first `<image>` placeholder in
/// `text_prompt`, or is prepended on its own line when there is none. The
/// result becomes the user turn of `template`; the assistant turn is left
/// open for generation.
#[must_use]
pub fn compose_prompt(
    template: &ConversationTemplate,
    text_prompt: &str,
    tokens_per_tile: usize,
    num_tiles: usize,
) -> ComposedPrompt {
    let block = image_token_block(tokens_per_tile, num_tiles);
    let user = if text_prompt.contains(IMAGE_PLACEHOLDER) {
        text_prompt.replacen(IMAGE_PLACEHOLDER, &block, 1)
    } else {
        format!("{block}\n{text_prompt}")
    };

    let mut conv = template.clone();
    conv.append_user(user);
    conv.append_assistant(None);

    ComposedPrompt {
        text: conv.prompt(),
        image_token_count: tokens_per_tile * num_tiles,
        stop_str: conv.stop_str(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
