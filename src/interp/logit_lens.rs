// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit lens: project hidden states to vocabulary at each layer.
//!
//! Every layer's residual stream is pushed through the vocabulary head as
//! if it were the last one, then normalised with a softmax over the
//! vocabulary. The result reads out what the model would predict at that
//! depth for every prompt position.

use candle_core::{D, DType, IndexOp, Tensor};

use super::alignment::ImageTokenSpan;
use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// HiddenStateStack
// ---------------------------------------------------------------------------

/// Hidden states of every layer for one generation step.
///
/// # Shapes
/// - `states`: `[layers, batch, seq, hidden]`
///
/// Layer 0 is the embedding output (image features merged in); layer `i`
/// is the output of decoder block `i`. The batch axis holds one row per
/// beam.
#[derive(Debug, Clone)]
pub struct HiddenStateStack {
    /// The stacked states.
    states: Tensor,
}

impl HiddenStateStack {
    /// Wrap a rank-4 tensor.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `states` is not rank 4 or has an
    /// empty layer axis.
    pub fn new(states: Tensor) -> Result<Self> {
        let dims = states.dims();
        if dims.len() != 4 {
            return Err(LensError::Shape(format!(
                "hidden state stack must be [layers, batch, seq, hidden], got {dims:?}"
            )));
        }
        if dims.first() == Some(&0) {
            return Err(LensError::Shape("hidden state stack has no layers".into()));
        }
        Ok(Self { states })
    }

    /// Stack per-layer `[batch, seq, hidden]` tensors in layer order.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `layers` is empty or the layers
    /// disagree in shape.
    pub fn from_layers(layers: &[Tensor]) -> Result<Self> {
        let first = layers
            .first()
            .ok_or_else(|| LensError::Shape("no hidden states to stack".into()))?;
        if let Some((i, bad)) = layers
            .iter()
            .enumerate()
            .find(|(_, t)| t.dims() != first.dims())
        {
            return Err(LensError::Shape(format!(
                "layer {i} has shape {:?}, layer 0 has {:?}",
                bad.dims(),
                first.dims()
            )));
        }
        Self::new(Tensor::stack(layers, 0)?)
    }

    /// The underlying tensor, `[layers, batch, seq, hidden]`.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.states
    }

    /// Number of layers, embedding output included.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.dim(0)
    }

    /// Batch (beam) size.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.dim(1)
    }

    /// Sequence length.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.dim(2)
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.dim(3)
    }

    /// Size of axis `i`; rank is checked at construction.
    fn dim(&self, i: usize) -> usize {
        self.states.dims().get(i).copied().unwrap_or(0)
    }

    /// States of one layer.
    ///
    /// # Shapes
    /// - returns: `[batch, seq, hidden]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `layer` is out of range.
    pub fn layer(&self, layer: usize) -> Result<Tensor> {
        if layer >= self.num_layers() {
            return Err(LensError::Shape(format!(
                "layer {layer} out of range for {} layers",
                self.num_layers()
            )));
        }
        Ok(self.states.i(layer)?)
    }

    /// Keep only the positions covered by `span`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if the span runs past the sequence.
    pub fn narrow_positions(&self, span: ImageTokenSpan) -> Result<Self> {
        if span.end() > self.seq_len() {
            return Err(LensError::Shape(format!(
                "span {:?} exceeds sequence length {}",
                span.range(),
                self.seq_len()
            )));
        }
        Self::new(self.states.narrow(2, span.start, span.len)?)
    }
}

// ---------------------------------------------------------------------------
// LayerProbabilities
// ---------------------------------------------------------------------------

/// Softmax-normalised vocabulary distributions per beam, layer and position.
///
/// # Shapes
/// - `probs`: `[beam, layer, position, vocab]`, `f32`
///
/// Each `(beam, layer, position)` row sums to one.
#[derive(Debug, Clone)]
pub struct LayerProbabilities {
    /// The probability tensor.
    probs: Tensor,
}

impl LayerProbabilities {
    /// Wrap a rank-4 probability tensor, casting it to `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `probs` is not rank 4.
    pub fn new(probs: Tensor) -> Result<Self> {
        if probs.rank() != 4 {
            return Err(LensError::Shape(format!(
                "layer probabilities must be [beam, layer, position, vocab], got {:?}",
                probs.dims()
            )));
        }
        Ok(Self {
            probs: probs.to_dtype(DType::F32)?,
        })
    }

    /// The underlying tensor, `[beam, layer, position, vocab]`.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.probs
    }

    /// Consume the wrapper and return the tensor.
    #[must_use]
    pub fn into_tensor(self) -> Tensor {
        self.probs
    }

    /// Number of beams.
    #[must_use]
    pub fn num_beams(&self) -> usize {
        self.dim(0)
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.dim(1)
    }

    /// Number of positions.
    #[must_use]
    pub fn num_positions(&self) -> usize {
        self.dim(2)
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.dim(3)
    }

    /// Size of axis `i`; rank is checked at construction.
    fn dim(&self, i: usize) -> usize {
        self.probs.dims().get(i).copied().unwrap_or(0)
    }

    /// Keep only the vocabulary entries in `token_ids`, in the given order.
    ///
    /// # Shapes
    /// - returns: `[beam, layer, position, token_ids.len()]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `token_ids` is empty or holds an id
    /// outside the vocabulary axis.
    pub fn select_tokens(&self, token_ids: &[u32]) -> Result<Tensor> {
        if token_ids.is_empty() {
            return Err(LensError::Shape("no token ids to select".into()));
        }
        let vocab = self.vocab_size();
        if let Some(&bad) = token_ids
            .iter()
            .find(|&&id| usize::try_from(id).ok().is_none_or(|id| id >= vocab))
        {
            return Err(LensError::Shape(format!(
                "token id {bad} outside vocabulary axis of size {vocab}"
            )));
        }
        let ids = Tensor::new(token_ids, self.probs.device())?;
        Ok(self.probs.index_select(&ids, 3)?)
    }

    /// The `k` most probable tokens at one `(beam, layer, position)`,
    /// most probable first.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if any index is out of range.
    pub fn top_k(
        &self,
        beam: usize,
        layer: usize,
        position: usize,
        k: usize,
    ) -> Result<Vec<(u32, f32)>> {
        if beam >= self.num_beams() || layer >= self.num_layers() || position >= self.num_positions()
        {
            return Err(LensError::Shape(format!(
                "index ({beam}, {layer}, {position}) out of range for {:?}",
                self.probs.dims()
            )));
        }
        let row: Vec<f32> = self.probs.i((beam, layer, position))?.to_vec1()?;
        let mut indexed: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        indexed
            .into_iter()
            .take(k)
            .map(|(id, p)| {
                u32::try_from(id)
                    .map(|id| (id, p))
                    .map_err(|_| LensError::Shape(format!("token index {id} overflows u32")))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Apply the logit lens to every layer of `stack`.
///
/// `project_fn` maps `[batch, seq, hidden]` to `[batch, seq, vocab]`
/// logits (the vocabulary head). Each layer is projected independently,
/// cast to `f32` and softmax-normalised over the vocabulary; layer order
/// is preserved.
///
/// # Shapes
/// - `stack`: `[layers, batch, seq, hidden]`
/// - returns: `[batch, layers, seq, vocab]`
///
/// # Errors
///
/// Returns [`LensError::Shape`] if the projection changes the batch or
/// sequence axes or disagrees on vocabulary size across layers, and
/// propagates projection errors.
pub fn project_with(
    stack: &HiddenStateStack,
    project_fn: impl Fn(&Tensor) -> Result<Tensor>,
) -> Result<LayerProbabilities> {
    let (batch, seq) = (stack.batch(), stack.seq_len());
    let mut layers = Vec::with_capacity(stack.num_layers());
    let mut vocab = None;

    for layer in 0..stack.num_layers() {
        let logits = project_fn(&stack.layer(layer)?)?;
        let (b, s, v) = logits.dims3()?;
        if (b, s) != (batch, seq) || vocab.is_some_and(|prev| prev != v) {
            return Err(LensError::Shape(format!(
                "projection of layer {layer} returned {:?}, expected [{batch}, {seq}, vocab]",
                logits.dims()
            )));
        }
        vocab = Some(v);
        let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
        layers.push(probs);
    }

    // [batch, seq, vocab] x layers -> [batch, layers, seq, vocab]
    let probs = Tensor::stack(&layers, 1)?;
    tracing::debug!(shape = ?probs.dims(), "logit lens projected");
    LayerProbabilities::new(probs)
}

/// Sum of each vocabulary row, for checking normalisation.
///
/// # Shapes
/// - returns: `[beam, layer, position]`
///
/// # Errors
///
/// Propagates tensor errors.
pub fn row_sums(probs: &LayerProbabilities) -> Result<Tensor> {
    Ok(probs.tensor().sum(D::Minus1)?)
}

// ---------------------------------------------------------------------------
// Human-readable predictions
// ---------------------------------------------------------------------------

/// A single token prediction from logit lens analysis.
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    /// Token ID in the vocabulary.
    pub token_id: u32,
    /// Decoded token string.
    pub token: String,
    /// Probability (0.0 to 1.0).
    pub probability: f32,
}

/// Decode token IDs to [`TokenPrediction`] using a decode function.
///
/// # Example
///
/// ```
/// use candle_vlm_lens::interp::logit_lens::decode_predictions_with;
///
/// let preds = decode_predictions_with(&[(42, 0.7), (99, 0.2)], |id| {
///     format!("token_{id}")
/// });
/// assert_eq!(preds.len(), 2);
/// assert_eq!(preds[0].token, "token_42");
/// ```
pub fn decode_predictions_with(
    predictions: &[(u32, f32)],
    decode_fn: impl Fn(u32) -> String,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, probability)| TokenPrediction {
            token_id,
            token: decode_fn(token_id),
            probability,
        })
        .collect()
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
