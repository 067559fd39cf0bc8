// SPDX-License-Identifier: MIT OR Apache-2.0

//! Confidence aggregation over logit-lens probabilities for a target class.
//!
//! All three reductions start from the probabilities of the class's
//! sub-word tokens, `[beam, layer, position, tokens]`, and take maxima:
//!
//! | output | reduced over | shape |
//! |---|---|---|
//! | [`internal_confidence`] | everything | scalar |
//! | [`confidence_heatmap`] | tokens, beams | `[position, layer]` |
//! | [`confidence_segmentation`] | tokens, layers, beams | `[side, side]` |

use candle_core::Tensor;

use super::logit_lens::LayerProbabilities;
use crate::error::{LensError, Result};
use crate::tokenizer::{LensTokenizer, SpecialTokenPolicy};

// ---------------------------------------------------------------------------
// ClassTokens
// ---------------------------------------------------------------------------

/// A target class word and the sub-word token ids that encode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTokens {
    /// The class string as given.
    class: String,
    /// Its sub-word ids (never empty).
    ids: Vec<u32>,
}

impl ClassTokens {
    /// Tokenize `class` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails, if `policy` does
    /// not match the tokenizer's special-token behaviour, or if the class
    /// encodes to no tokens.
    pub fn resolve(
        tokenizer: &LensTokenizer,
        class: &str,
        policy: SpecialTokenPolicy,
    ) -> Result<Self> {
        let ids = tokenizer.encode_class(class, policy)?;
        tracing::debug!(class, ?ids, ?policy, "resolved class tokens");
        Self::from_ids(class, ids)
    }

    /// Build from already-known ids.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if `ids` is empty.
    pub fn from_ids(class: impl Into<String>, ids: Vec<u32>) -> Result<Self> {
        let class = class.into();
        if ids.is_empty() {
            return Err(LensError::Tokenizer(format!(
                "class '{class}' has no sub-word tokens"
            )));
        }
        Ok(Self { class, ids })
    }

    /// The class string.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The sub-word ids.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

// ---------------------------------------------------------------------------
// Output wrappers
// ---------------------------------------------------------------------------

/// Per-position, per-layer confidence for one class.
///
/// # Shapes
/// - `values`: `[position, layer]`
#[derive(Debug, Clone)]
pub struct ConfidenceHeatmap {
    /// Heatmap values.
    values: Tensor,
}

impl ConfidenceHeatmap {
    /// The heatmap tensor, `[position, layer]`.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.values
    }

    /// `(positions, layers)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        match self.values.dims() {
            &[p, l] => (p, l),
            _ => (0, 0),
        }
    }

    /// Copy the heatmap out as rows of positions.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn to_rows(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.values.to_vec2()?)
    }
}

/// Square per-patch confidence grid, row-major over the image.
///
/// # Shapes
/// - `values`: `[side, side]`
#[derive(Debug, Clone)]
pub struct ConfidenceGrid {
    /// Grid values.
    values: Tensor,
    /// Grid side.
    side: usize,
}

impl ConfidenceGrid {
    /// The grid tensor, `[side, side]`.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.values
    }

    /// Grid side length.
    #[must_use]
    pub const fn side(&self) -> usize {
        self.side
    }

    /// Copy the grid out as rows.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn to_rows(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.values.to_vec2()?)
    }
}

/// Scalar confidence, heatmap and segmentation grid for one class.
#[derive(Debug, Clone)]
pub struct ConfidenceReport {
    /// The class that was scored.
    pub class: ClassTokens,
    /// Global maximum probability.
    pub confidence: f32,
    /// `[position, layer]` heatmap.
    pub heatmap: ConfidenceHeatmap,
    /// `[side, side]` segmentation grid.
    pub grid: ConfidenceGrid,
}

impl ConfidenceReport {
    /// Run all three reductions.
    ///
    /// # Errors
    ///
    /// Propagates the errors of the individual reductions.
    pub fn compute(probs: &LayerProbabilities, class: &ClassTokens) -> Result<Self> {
        Ok(Self {
            class: class.clone(),
            confidence: internal_confidence(probs, class)?,
            heatmap: confidence_heatmap(probs, class)?,
            grid: confidence_segmentation(probs, class)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

/// Maximum probability of any class sub-word over every beam, layer and
/// position.
///
/// # Errors
///
/// Returns [`LensError::Shape`] if a class id lies outside the vocabulary
/// axis or the tensor is empty.
pub fn internal_confidence(probs: &LayerProbabilities, class: &ClassTokens) -> Result<f32> {
    let selected = probs.select_tokens(class.ids())?;
    if selected.elem_count() == 0 {
        return Err(LensError::Shape("no probabilities to reduce".into()));
    }
    Ok(selected.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Maximum over class sub-words and beams, laid out as `[position, layer]`.
///
/// # Errors
///
/// Returns [`LensError::Shape`] if a class id lies outside the vocabulary
/// axis.
pub fn confidence_heatmap(
    probs: &LayerProbabilities,
    class: &ClassTokens,
) -> Result<ConfidenceHeatmap> {
    // [beam, layer, pos, k] -> [beam, layer, pos] -> [layer, pos] -> [pos, layer]
    let values = probs
        .select_tokens(class.ids())?
        .max(3)?
        .max(0)?
        .t()?
        .contiguous()?;
    Ok(ConfidenceHeatmap { values })
}

/// Maximum over class sub-words, then layers, then beams, reshaped
/// row-major into a square grid.
///
/// # Errors
///
/// Returns [`LensError::Shape`] if the number of positions is not a
/// perfect square or a class id lies outside the vocabulary axis.
pub fn confidence_segmentation(
    probs: &LayerProbabilities,
    class: &ClassTokens,
) -> Result<ConfidenceGrid> {
    let side = grid_side(probs.num_positions())?;
    // [beam, layer, pos, k] -> [beam, layer, pos] -> [beam, pos] -> [pos]
    let per_position = probs
        .select_tokens(class.ids())?
        .max(3)?
        .max(1)?
        .max(0)?;
    let values = per_position.reshape((side, side))?;
    Ok(ConfidenceGrid { values, side })
}

/// Side of the square grid holding `positions` cells.
///
/// ```
/// use candle_vlm_lens::interp::confidence::grid_side;
///
/// assert_eq!(grid_side(9).unwrap(), 3);
/// assert!(grid_side(10).is_err());
/// ```
///
/// # Errors
///
/// Returns [`LensError::Shape`] if `positions` is zero or not a perfect
/// square.
pub fn grid_side(positions: usize) -> Result<usize> {
    let side = positions.isqrt();
    if positions == 0 || side * side != positions {
        return Err(LensError::Shape(format!(
            "{positions} positions do not form a square grid"
        )));
    }
    Ok(side)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
