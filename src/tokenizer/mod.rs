// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer wrapper and the target-class tokenization convention.
//!
//! [`LensTokenizer`] wraps a `HuggingFace` `tokenizers` tokenizer with the
//! handful of operations the pipeline needs: raw prompt encoding, special
//! token lookup, caption decoding, and class-word encoding under an explicit
//! [`SpecialTokenPolicy`].

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// SpecialTokenPolicy
// ---------------------------------------------------------------------------

/// How a target class string is turned into sub-word token ids.
///
/// Two conventions exist in the wild:
///
/// - [`Raw`](Self::Raw): encode without special tokens and keep every id.
///   Correct for tokenizers whose post-processor adds nothing (the Qwen2
///   tokenizer shipped with InternVL 2.5 1B/4B).
/// - [`StripLeading`](Self::StripLeading): encode with special tokens and
///   drop the first id, assuming it is a BOS marker. Correct only for
///   tokenizers that prepend one (`LLaMA`, `InternLM2`); applied to a
///   tokenizer that does not, it silently drops the first sub-word, so
///   [`LensTokenizer::encode_class`] refuses that combination.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialTokenPolicy {
    /// Encode without special tokens; keep all ids.
    #[default]
    Raw,
    /// Encode with special tokens; strip the leading special token.
    StripLeading,
}

// ---------------------------------------------------------------------------
// LensTokenizer
// ---------------------------------------------------------------------------

/// `HuggingFace` tokenizer used for prompts, captions and class words.
///
/// # Example
///
/// ```no_run
/// use candle_vlm_lens::{LensTokenizer, SpecialTokenPolicy};
///
/// # fn main() -> candle_vlm_lens::Result<()> {
/// let tok = LensTokenizer::from_hf_path("tokenizer.json")?;
/// let ids = tok.encode_class("cat", SpecialTokenPolicy::Raw)?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct LensTokenizer {
    /// Underlying `tokenizers` instance.
    inner: Box<tokenizers::Tokenizer>,
}

impl LensTokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_hf_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            LensError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::from_hf(tok))
    }

    /// Wrap an already-loaded `HuggingFace` tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self {
            inner: Box::new(tokenizer),
        }
    }

    /// Encode text with the tokenizer's post-processor (BOS etc. if configured).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, true)
    }

    /// Encode text **without** adding special tokens.
    ///
    /// Used for composed prompts, whose template already carries every
    /// marker the model expects.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, false)
    }

    /// Shared encode path.
    fn encode_with(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| LensError::Tokenizer(format!("HF encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Whether encoding with special tokens prepends an extra token.
    ///
    /// Probed on a fixed string by comparing both encode modes.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn adds_leading_special_token(&self) -> Result<bool> {
        let probe = "a";
        let with = self.encode(probe)?;
        let without = self.encode_raw(probe)?;
        Ok(with.len() == without.len() + 1 && with.get(1..) == Some(without.as_slice()))
    }

    /// Sub-word token ids of a target class string under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails, if the class
    /// encodes to no tokens, or if `policy` is
    /// [`StripLeading`](SpecialTokenPolicy::StripLeading) but this tokenizer
    /// does not prepend a special token.
    pub fn encode_class(&self, class: &str, policy: SpecialTokenPolicy) -> Result<Vec<u32>> {
        let ids = match policy {
            SpecialTokenPolicy::Raw => self.encode_raw(class)?,
            SpecialTokenPolicy::StripLeading => {
                if !self.adds_leading_special_token()? {
                    return Err(LensError::Tokenizer(
                        "StripLeading policy requested but the tokenizer adds no leading \
                         special token; use SpecialTokenPolicy::Raw"
                            .into(),
                    ));
                }
                let mut ids = self.encode(class)?;
                if !ids.is_empty() {
                    ids.remove(0);
                }
                ids
            }
        };
        if ids.is_empty() {
            return Err(LensError::Tokenizer(format!(
                "class {class:?} encodes to no tokens"
            )));
        }
        Ok(ids)
    }

    /// Look up the id of a single token string (e.g. `<IMG_CONTEXT>`).
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Like [`token_to_id`](Self::token_to_id) but errors when absent.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the token is not in the vocabulary.
    pub fn require_token_id(&self, token: &str) -> Result<u32> {
        self.token_to_id(token)
            .ok_or_else(|| LensError::Tokenizer(format!("token {token:?} not in vocabulary")))
    }

    /// Id of the padding token, if the tokenizer configures one.
    #[must_use]
    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner.get_padding().map(|p| p.pad_id)
    }

    /// Decode token ids back to a string, keeping special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| LensError::Tokenizer(format!("HF decode failed: {e}")))
    }

    /// Decode token ids, dropping special tokens (caption text).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn decode_skip_special(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| LensError::Tokenizer(format!("HF decode failed: {e}")))
    }

    /// Full vocabulary including added tokens, token string → id.
    #[must_use]
    pub fn vocabulary(&self) -> HashMap<String, u32> {
        self.inner.get_vocab(true)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for LensTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Inline `tokenizer.json` documents for tests (word-level, whitespace split).
#[cfg(test)]
pub(crate) mod fixtures {
    use std::str::FromStr;

    use super::LensTokenizer;

    /// Vocabulary shared by both fixtures.
    const VOCAB: &str = r#"{
        "[UNK]": 0, "<s>": 1, "<pad>": 2, "a": 3, "cat": 4, "dog": 5,
        "tabby": 6, "on": 7, "the": 8, "mat": 9, "<|im_end|>": 10,
        "<img>": 11, "</img>": 12, "<IMG_CONTEXT>": 13
    }"#;

    /// Build a tokenizer JSON, optionally with a BOS-prepending post-processor.
    fn tokenizer_json(with_bos: bool) -> String {
        let post_processor = if with_bos {
            r#"{
                "type": "TemplateProcessing",
                "single": [
                    {"SpecialToken": {"id": "<s>", "type_id": 0}},
                    {"Sequence": {"id": "A", "type_id": 0}}
                ],
                "pair": [
                    {"SpecialToken": {"id": "<s>", "type_id": 0}},
                    {"Sequence": {"id": "A", "type_id": 0}},
                    {"Sequence": {"id": "B", "type_id": 1}}
                ],
                "special_tokens": {
                    "<s>": {"id": "<s>", "ids": [1], "tokens": ["<s>"]}
                }
            }"#
        } else {
            "null"
        };
        format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {{"type": "Whitespace"}},
                "post_processor": {post_processor},
                "decoder": null,
                "model": {{"type": "WordLevel", "vocab": {VOCAB}, "unk_token": "[UNK]"}}
            }}"#
        )
    }

    /// Tokenizer whose post-processor adds nothing (Qwen2-like).
    pub(crate) fn plain_tokenizer() -> LensTokenizer {
        #[allow(clippy::expect_used)]
        let tok = tokenizers::Tokenizer::from_str(&tokenizer_json(false))
            .expect("fixture tokenizer must parse");
        LensTokenizer::from_hf(tok)
    }

    /// Tokenizer that prepends `<s>` (LLaMA-like).
    pub(crate) fn bos_tokenizer() -> LensTokenizer {
        #[allow(clippy::expect_used)]
        let tok = tokenizers::Tokenizer::from_str(&tokenizer_json(true))
            .expect("fixture tokenizer must parse");
        LensTokenizer::from_hf(tok)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::fixtures::{bos_tokenizer, plain_tokenizer};
    use super::*;

    #[test]
    fn fixtures_document_their_special_token_behavior() {
        assert!(!plain_tokenizer().adds_leading_special_token().unwrap());
        assert!(bos_tokenizer().adds_leading_special_token().unwrap());
        assert_eq!(bos_tokenizer().encode("cat").unwrap(), vec![1, 4]);
        assert_eq!(plain_tokenizer().encode("cat").unwrap(), vec![4]);
    }

    #[test]
    fn raw_policy_keeps_all_subwords() {
        let tok = plain_tokenizer();
        let ids = tok.encode_class("tabby cat", SpecialTokenPolicy::Raw).unwrap();
        assert_eq!(ids, vec![6, 4]);

        // Raw is also correct for a BOS tokenizer: no special token is added.
        let ids = bos_tokenizer()
            .encode_class("tabby cat", SpecialTokenPolicy::Raw)
            .unwrap();
        assert_eq!(ids, vec![6, 4]);
    }

    #[test]
    fn strip_leading_drops_bos_only() {
        let ids = bos_tokenizer()
            .encode_class("tabby cat", SpecialTokenPolicy::StripLeading)
            .unwrap();
        assert_eq!(ids, vec![6, 4]);
    }

    #[test]
    fn strip_leading_rejected_without_bos() {
        // Would silently drop "tabby" on a tokenizer that adds no BOS.
        let err = plain_tokenizer()
            .encode_class("tabby cat", SpecialTokenPolicy::StripLeading)
            .unwrap_err();
        assert!(matches!(err, LensError::Tokenizer(_)));
    }

    #[test]
    fn empty_class_rejected() {
        assert!(
            plain_tokenizer()
                .encode_class("", SpecialTokenPolicy::Raw)
                .is_err()
        );
    }

    #[test]
    fn special_token_lookup() {
        let tok = plain_tokenizer();
        assert_eq!(tok.token_to_id("<IMG_CONTEXT>"), Some(13));
        assert_eq!(tok.require_token_id("<|im_end|>").unwrap(), 10);
        assert!(tok.require_token_id("<missing>").is_err());
        assert_eq!(tok.pad_token_id(), None);
        assert_eq!(tok.vocabulary().get("mat"), Some(&9));
    }

    #[test]
    fn policy_deserializes_from_snake_case() {
        let p: SpecialTokenPolicy = serde_json::from_str("\"strip_leading\"").unwrap();
        assert_eq!(p, SpecialTokenPolicy::StripLeading);
        assert_eq!(SpecialTokenPolicy::default(), SpecialTokenPolicy::Raw);
    }
}
