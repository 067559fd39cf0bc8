// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools: logit lens, image-span alignment, confidence.
//!
//! - [`logit_lens`]: per-layer projection of hidden states to vocabulary
//!   probabilities.
//! - [`alignment`]: locating the image-context token run in a prompt.
//! - [`confidence`]: reducing layer probabilities for a target class to a
//!   scalar, a heatmap and a segmentation grid.

pub mod alignment;
pub mod confidence;
pub mod logit_lens;
