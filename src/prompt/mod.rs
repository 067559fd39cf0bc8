// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt composition: image-token blocks and conversation templates.
//!
//! - [`conversation`]: named chat templates (role markers, separators).
//! - [`composer`]: weave the image-token block into a text prompt.

pub mod composer;
pub mod conversation;

/// Marker opening the image-token block.
pub const IMG_START_TOKEN: &str = "<img>";
/// Marker closing the image-token block.
pub const IMG_END_TOKEN: &str = "</img>";
/// Placeholder token standing in for one image patch's visual features.
pub const IMG_CONTEXT_TOKEN: &str = "<IMG_CONTEXT>";
/// Placeholder in user prompts marking where the image block goes.
pub const IMAGE_PLACEHOLDER: &str = "<image>";
/// Prompt used when the caller supplies none.
pub const DEFAULT_PROMPT: &str = "Write a detailed description.";
