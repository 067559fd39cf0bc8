// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vocabulary head and token embedding table of the language model.
//!
//! The logit lens only needs two matrices from a checkpoint: the
//! unembedding (`lm_head`) and the input embeddings. [`LensHead`] loads
//! both from safetensors, following the tensor naming of the language
//! model family, so that a [`VlmBackend`](crate::VlmBackend) only has to
//! supply generation.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::config::VisionLanguageConfig;
use crate::download::ModelFiles;
use crate::error::{LensError, Result};

/// Prefix of language-model tensors inside an InternVL checkpoint.
const LANGUAGE_MODEL_PREFIX: &str = "language_model";

/// Unembedding matrix and embedding table of the language model.
#[derive(Debug, Clone)]
pub struct LensHead {
    /// `[vocab, hidden]` projection, no bias.
    lm_head: Linear,
    /// `[vocab, hidden]` lookup table.
    embed_tokens: Embedding,
    /// Hidden dimension.
    hidden_size: usize,
    /// Vocabulary size.
    vocab_size: usize,
}

impl LensHead {
    /// Load the head from a checkpoint-rooted [`VarBuilder`].
    ///
    /// The head falls back to the embedding table when embeddings are tied
    /// or the checkpoint carries no separate head tensor.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if a tensor is missing or has the wrong
    /// shape.
    pub fn load(config: &VisionLanguageConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (vocab, hidden) = (config.vocab_size, config.hidden_size);
        let family = config.llm_family;
        let vb = vb.pp(LANGUAGE_MODEL_PREFIX);

        let embeddings = vb.get((vocab, hidden), family.embedding_tensor())?;
        let head_name = family.head_tensor();
        let head_weight = if config.tie_word_embeddings || !vb.contains_tensor(head_name) {
            tracing::debug!(%family, "vocabulary head tied to embeddings");
            // BORROW: explicit .clone(), Tensor is reference-counted
            embeddings.clone()
        } else {
            vb.get((vocab, hidden), head_name)?
        };

        Ok(Self {
            lm_head: Linear::new(head_weight, None),
            embed_tokens: Embedding::new(embeddings, hidden),
            hidden_size: hidden,
            vocab_size: vocab,
        })
    }

    /// Load the head from resolved checkpoint files.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for sharded checkpoints without the
    /// `mmap` feature, and propagates weight loading errors.
    pub fn from_files(
        config: &VisionLanguageConfig,
        files: &ModelFiles,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb = create_var_builder(&files.weights, dtype, device)?;
        let head = Self::load(config, vb)?;
        tracing::info!(
            vocab = head.vocab_size,
            hidden = head.hidden_size,
            ?dtype,
            "loaded vocabulary head"
        );
        Ok(head)
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on shape mismatch.
    pub fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        let hidden = hidden.to_dtype(self.lm_head.weight().dtype())?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// Look up token embeddings.
    ///
    /// # Shapes
    /// - `ids`: `[...]`, `u32`
    /// - returns: `[..., hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] for ids outside the table.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(ids)?)
    }

    /// The full embedding table, `[vocab_size, hidden_size]`, row `i` for
    /// token id `i`.
    #[must_use]
    pub fn embedding_table(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    /// Hidden dimension.
    #[must_use]
    pub const fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Vocabulary size.
    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading, which also supports sharded checkpoints.
fn create_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered reading; single-file checkpoints only.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if paths.len() > 1 {
        return Err(LensError::Config(
            "sharded checkpoints require the `mmap` feature: \
             candle-vlm-lens = { features = [\"mmap\"] }"
                .into(),
        ));
    }
    let path = paths
        .first()
        .ok_or_else(|| LensError::Config("no safetensors files".into()))?;
    let data = std::fs::read(path)?;
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the head is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::LlmFamily;

    fn config(family: LlmFamily, tied: bool) -> VisionLanguageConfig {
        VisionLanguageConfig {
            template: "internvl2_5".into(),
            num_image_token: 4,
            image_size: 28,
            patch_size: 14,
            downsample_ratio: 1.0,
            min_dynamic_patch: 1,
            max_dynamic_patch: 1,
            use_thumbnail: false,
            llm_family: family,
            hidden_size: 2,
            num_layers: 2,
            vocab_size: 3,
            tie_word_embeddings: tied,
        }
    }

    fn embeddings() -> Tensor {
        Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &Device::Cpu).unwrap()
    }

    fn head_weight() -> Tensor {
        Tensor::new(&[[2.0f32, 0.0], [0.0, 2.0], [0.0, 0.0]], &Device::Cpu).unwrap()
    }

    fn var_builder(tensors: Vec<(&str, Tensor)>) -> VarBuilder<'static> {
        let map: HashMap<String, Tensor> =
            tensors.into_iter().map(|(k, v)| (k.to_owned(), v)).collect();
        VarBuilder::from_tensors(map, DType::F32, &Device::Cpu)
    }

    #[test]
    fn untied_head_uses_lm_head() {
        let vb = var_builder(vec![
            ("language_model.model.embed_tokens.weight", embeddings()),
            ("language_model.lm_head.weight", head_weight()),
        ]);
        let head = LensHead::load(&config(LlmFamily::Qwen2, false), vb).unwrap();
        let hidden = Tensor::new(&[[[1.0f32, 3.0]]], &Device::Cpu).unwrap();
        let logits: Vec<f32> = head.project(&hidden).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(logits, vec![2.0, 6.0, 0.0]);
    }

    #[test]
    fn tied_or_missing_head_uses_embeddings() {
        let vb = var_builder(vec![("language_model.model.embed_tokens.weight", embeddings())]);
        let head = LensHead::load(&config(LlmFamily::Qwen2, false), vb).unwrap();
        let hidden = Tensor::new(&[[1.0f32, 3.0]], &Device::Cpu).unwrap();
        let logits: Vec<f32> = head.project(&hidden).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(logits, vec![1.0, 3.0, 4.0]);
    }

    #[test]
    fn internlm2_tensor_names() {
        let vb = var_builder(vec![
            ("language_model.model.tok_embeddings.weight", embeddings()),
            ("language_model.output.weight", head_weight()),
        ]);
        let head = LensHead::load(&config(LlmFamily::InternLm2, false), vb).unwrap();
        assert_eq!(head.vocab_size(), 3);
        let ids = Tensor::new(&[2u32, 0], &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = head.embed(&ids).unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1.0, 1.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn wrong_shape_rejected() {
        let vb = var_builder(vec![(
            "language_model.model.embed_tokens.weight",
            Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap(),
        )]);
        assert!(LensHead::load(&config(LlmFamily::Qwen2, true), vb).is_err());
    }

    #[test]
    fn loads_from_safetensors_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let tensors: HashMap<String, Tensor> = [(
            "language_model.model.embed_tokens.weight".to_owned(),
            embeddings(),
        )]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let files = ModelFiles {
            config: dir.path().join("config.json"),
            tokenizer: dir.path().join("tokenizer.json"),
            weights: vec![path],
        };
        let head =
            LensHead::from_files(&config(LlmFamily::Qwen2, true), &files, &Device::Cpu, DType::F32)
                .unwrap();
        assert_eq!(head.embedding_table().dims(), &[3, 2]);
    }
}
