// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model boundary: the backend trait and the model wrapper.
//!
//! [`VlmBackend`] is what a vision-language model implementation provides:
//! image-conditioned generation, the vocabulary head and the token
//! embedding table. [`VlmModel`] wraps a backend with its device and the
//! [`HookRegistry`] passed to every generation call.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use crate::hooks::{HookHandle, HookPoint, HookRegistry};
use crate::interp::logit_lens::{HiddenStateStack, LayerProbabilities, project_with};
use crate::vision::pixels::PixelBatch;

// ---------------------------------------------------------------------------
// Generation parameters and results
// ---------------------------------------------------------------------------

/// Parameters of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Sampling temperature; `<= 0.0` means greedy.
    pub temperature: f64,
    /// Number of beams.
    pub num_beams: usize,
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
    /// Token that ends generation, if any.
    pub eos_token_id: Option<u32>,
    /// Whether the backend may reuse a key/value cache across steps.
    pub use_cache: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            num_beams: 1,
            max_new_tokens: 512,
            eos_token_id: None,
            use_cache: true,
        }
    }
}

/// Inputs of one generation call.
///
/// # Shapes
/// - `input_ids`: `[1, seq]` -- prompt ids, `u32`
/// - `attention_mask`: `[1, seq]` -- 1 for real tokens, 0 for padding, `u32`
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Image tiles; `None` for a text-only call.
    pub pixel_values: Option<&'a PixelBatch>,
    /// Prompt token ids.
    pub input_ids: &'a Tensor,
    /// Attention mask over the prompt.
    pub attention_mask: &'a Tensor,
    /// Generation parameters.
    pub config: &'a GenerationConfig,
    /// Whether to return the step-zero hidden states.
    pub output_hidden_states: bool,
}

/// Output of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Generated ids per beam, prompt excluded, best beam first.
    pub sequences: Vec<Vec<u32>>,
    /// Hidden states of every layer at generation step zero, when requested.
    pub hidden_states: Option<HiddenStateStack>,
}

// ---------------------------------------------------------------------------
// VlmBackend trait
// ---------------------------------------------------------------------------

/// Interface a vision-language model implementation provides.
///
/// The backend owns the vision tower, the language model and its
/// generation loop. It must consult the [`HookRegistry`] it is given at
/// every [`HookPoint`] its forward pass reaches, including
/// [`HookPoint::ResidPre`] and [`HookPoint::ResidPost`] for each decoder
/// block.
pub trait VlmBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of decoder blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension of the language model.
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Image-context tokens produced per tile.
    fn num_image_token(&self) -> usize;

    /// Name of the conversation template the checkpoint was trained with.
    fn template_name(&self) -> &str;

    /// Floating-point type of the weights.
    fn dtype(&self) -> DType {
        DType::F32
    }

    // --- Generation ------------------------------------------------------

    /// Image-conditioned autoregressive generation.
    ///
    /// When `request.output_hidden_states` is set, the returned
    /// [`GenerationOutput::hidden_states`] holds `num_layers() + 1` layers
    /// (embedding output first) for the step that attends over the full
    /// prompt, with one batch row per beam.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// failures and propagates hook errors.
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        hooks: &HookRegistry,
    ) -> Result<GenerationOutput>;

    // --- Vocabulary head and embeddings ----------------------------------

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on shape
    /// mismatch.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Look up token embeddings.
    ///
    /// # Shapes
    /// - `ids`: `[...]`, `u32`
    /// - returns: `[..., hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) for ids
    /// outside the table.
    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// VlmModel
// ---------------------------------------------------------------------------

/// A backend together with its device and hook registry.
pub struct VlmModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn VlmBackend>,
    /// The device this model lives on.
    device: Device,
    /// Hooks consulted during generation.
    hooks: HookRegistry,
}

impl VlmModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn VlmBackend>, device: Device) -> Self {
        Self {
            backend,
            device,
            hooks: HookRegistry::new(),
        }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Floating-point type of the weights.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.backend.dtype()
    }

    /// Number of decoder blocks.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Image-context tokens per tile.
    #[must_use]
    pub fn num_image_token(&self) -> usize {
        self.backend.num_image_token()
    }

    /// Conversation template name.
    #[must_use]
    pub fn template_name(&self) -> &str {
        self.backend.template_name()
    }

    /// The hook registry consulted by [`generate`](Self::generate).
    #[must_use]
    pub const fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Register a hook; it stays active until the handle is dropped.
    pub fn register_hook<F>(&self, point: HookPoint, callback: F) -> HookHandle
    where
        F: Fn(&HookPoint, &Tensor) -> Result<Option<Tensor>> + Send + Sync + 'static,
    {
        self.hooks.register(point, callback)
    }

    /// Run generation with the registered hooks.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput> {
        self.backend.generate(request, &self.hooks)
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.backend.project_to_vocab(hidden)
    }

    /// Look up token embeddings.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        self.backend.embed_tokens(ids)
    }

    /// Apply the logit lens to every layer of `stack`.
    ///
    /// # Shapes
    /// - `stack`: `[layers, batch, seq, hidden]`
    /// - returns: `[batch, layers, seq, vocab]`
    ///
    /// # Errors
    ///
    /// Propagates projection and shape errors.
    pub fn logit_lens(&self, stack: &HiddenStateStack) -> Result<LayerProbabilities> {
        project_with(stack, |hidden| self.project_to_vocab(hidden))
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn VlmBackend {
        &*self.backend
    }
}

impl std::fmt::Debug for VlmModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmModel")
            .field("device", &self.device)
            .field("num_layers", &self.num_layers())
            .field("vocab_size", &self.vocab_size())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
