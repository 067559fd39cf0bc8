// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-lived model context shared by every pipeline call.

use std::collections::HashMap;

use candle_core::{D, DType, Device, IndexOp, Tensor};

use crate::backend::{GenerationConfig, VlmModel};
use crate::error::{LensError, Result};
use crate::hooks::{HookHandle, HookPoint};
use crate::prompt::IMG_CONTEXT_TOKEN;
use crate::prompt::conversation::ConversationTemplate;
use crate::runner::run_ids;
use crate::tokenizer::LensTokenizer;

/// Distance above which a recomputed embedding is reported as suspicious.
pub const EMBEDDING_CHECK_THRESHOLD: f32 = 0.1;

/// Max new tokens for the text-only forward behind
/// [`ModelState::hidden_layer_embedding`].
const EMBEDDING_MAX_NEW_TOKENS: usize = 10;

/// Model, tokenizer and the lookup tables derived from them.
///
/// Built once and passed by reference to every pipeline function. All
/// methods take `&self`; hook registration goes through the model's
/// internally synchronised registry.
pub struct ModelState {
    /// The wrapped backend.
    model: VlmModel,
    /// Tokenizer matching the checkpoint.
    tokenizer: LensTokenizer,
    /// Model identifier, e.g. `OpenGVLab/InternVL2_5-1B`.
    model_name: String,
    /// Token string → id.
    vocabulary: HashMap<String, u32>,
    /// `[vocab_size, hidden_size]`; row `i` embeds token id `i`.
    vocab_embeddings: Tensor,
}

impl ModelState {
    /// Bundle a model and tokenizer and precompute the vocabulary tables.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the tokenizer lacks the
    /// image-context token, and propagates embedding lookup errors.
    pub fn new(
        model: VlmModel,
        tokenizer: LensTokenizer,
        model_name: impl Into<String>,
    ) -> Result<Self> {
        tokenizer.require_token_id(IMG_CONTEXT_TOKEN)?;
        let vocab_size = u32::try_from(model.vocab_size())
            .map_err(|_| LensError::Config("vocabulary size overflows u32".into()))?;
        let ids = Tensor::arange(0u32, vocab_size, model.device())?;
        let vocab_embeddings = model.embed_tokens(&ids)?;
        let vocabulary = tokenizer.vocabulary();
        let model_name = model_name.into();

        tracing::info!(
            model = %model_name,
            layers = model.num_layers(),
            vocab = vocab_size,
            tokenizer_vocab = vocabulary.len(),
            "model state ready"
        );
        Ok(Self {
            model,
            tokenizer,
            model_name,
            vocabulary,
            vocab_embeddings,
        })
    }

    /// The wrapped model.
    #[must_use]
    pub const fn model(&self) -> &VlmModel {
        &self.model
    }

    /// The tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &LensTokenizer {
        &self.tokenizer
    }

    /// Model identifier.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Token string → id map, special tokens included.
    #[must_use]
    pub const fn vocabulary(&self) -> &HashMap<String, u32> {
        &self.vocabulary
    }

    /// Embedding of every token id, `[vocab_size, hidden_size]`.
    #[must_use]
    pub const fn vocab_embeddings(&self) -> &Tensor {
        &self.vocab_embeddings
    }

    /// Device the model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        self.model.device()
    }

    /// Id of the `<IMG_CONTEXT>` token.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the token is unknown.
    pub fn image_context_id(&self) -> Result<u32> {
        self.tokenizer.require_token_id(IMG_CONTEXT_TOKEN)
    }

    /// Conversation template: `name` if given, else the model's own.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for unknown template names.
    pub fn template(&self, name: Option<&str>) -> Result<ConversationTemplate> {
        ConversationTemplate::lookup(name.unwrap_or_else(|| self.model.template_name()))
    }

    // --- Hooks -----------------------------------------------------------

    /// Run `callback` on the output of decoder block `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `layer` is out of range.
    pub fn register_hook<F>(&self, layer: usize, callback: F) -> Result<HookHandle>
    where
        F: Fn(&HookPoint, &Tensor) -> Result<Option<Tensor>> + Send + Sync + 'static,
    {
        self.check_layer(layer)?;
        Ok(self.model.register_hook(HookPoint::ResidPost(layer), callback))
    }

    /// Run `callback` on the input of decoder block `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `layer` is out of range.
    pub fn register_pre_hook<F>(&self, layer: usize, callback: F) -> Result<HookHandle>
    where
        F: Fn(&HookPoint, &Tensor) -> Result<Option<Tensor>> + Send + Sync + 'static,
    {
        self.check_layer(layer)?;
        Ok(self.model.register_hook(HookPoint::ResidPre(layer), callback))
    }

    /// Fail unless `layer` names a decoder block.
    fn check_layer(&self, layer: usize) -> Result<()> {
        let n = self.model.num_layers();
        if layer >= n {
            return Err(LensError::Hook(format!(
                "layer {layer} out of range for {n} decoder blocks"
            )));
        }
        Ok(())
    }

    // --- Text embeddings -------------------------------------------------

    /// Hidden state of the last sub-token of `text` at `layer`.
    ///
    /// Runs a short text-only generation and reads the step-zero hidden
    /// states. Layer 0 is the embedding output, so it is compared against
    /// the vocabulary embedding of the last sub-token; a distance above
    /// [`EMBEDDING_CHECK_THRESHOLD`] is logged as a warning and does not
    /// abort.
    ///
    /// # Shapes
    /// - returns: `[1, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if `text` encodes to nothing,
    /// [`LensError::Shape`] if `layer` is out of range or the backend
    /// returns no hidden states, and propagates model errors.
    pub fn hidden_layer_embedding(&self, text: &str, layer: usize) -> Result<Tensor> {
        let ids = self.tokenizer.encode_raw(text)?;
        let (last_pos, &last_id) = ids
            .iter()
            .enumerate()
            .next_back()
            .ok_or_else(|| LensError::Tokenizer(format!("'{text}' encodes to no tokens")))?;

        let stop = self.template(None)?.stop_str();
        let config = GenerationConfig {
            max_new_tokens: EMBEDDING_MAX_NEW_TOKENS,
            eos_token_id: self.tokenizer.token_to_id(stop),
            use_cache: false,
            ..GenerationConfig::default()
        };
        let run = run_ids(self, None, &ids, &config, true)?;
        let stack = run
            .hidden_states
            .ok_or_else(|| LensError::Shape("backend returned no hidden states".into()))?;
        if layer >= stack.num_layers() {
            return Err(LensError::Shape(format!(
                "layer {layer} out of range for {} hidden-state layers",
                stack.num_layers()
            )));
        }

        let recomputed = stack.layer(0)?.i((0, last_pos))?.to_dtype(DType::F32)?;
        let reference = self
            .vocab_embeddings
            .i(usize::try_from(last_id).map_err(|_| {
                LensError::Shape(format!("token id {last_id} overflows usize"))
            })?)?
            .to_dtype(DType::F32)?;
        let dist: f32 = (recomputed - reference)?
            .sqr()?
            .sum(D::Minus1)?
            .sqrt()?
            .to_scalar()?;
        if dist > EMBEDDING_CHECK_THRESHOLD {
            tracing::warn!(
                text,
                token_id = last_id,
                dist,
                "embedding validation failed: layer-0 state differs from vocabulary embedding"
            );
        }

        Ok(stack.layer(layer)?.i((0..1, last_pos))?)
    }
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelState")
            .field("model_name", &self.model_name)
            .field("model", &self.model)
            .field("tokenizer", &self.tokenizer)
            .field("vocab_embeddings", &self.vocab_embeddings.dims())
            .finish_non_exhaustive()
    }
}
