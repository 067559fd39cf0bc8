// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolve model files through the `HuggingFace` hub cache.
//!
//! [`fetch_model_files`] downloads (or finds in `~/.cache/huggingface/hub/`)
//! the files the lens needs: `config.json`, `tokenizer.json` and the
//! safetensors weights, single-file or sharded. [`local_model_files`] does
//! the same for a checkpoint directory on disk.
//!
//! ```rust,no_run
//! # fn main() -> candle_vlm_lens::Result<()> {
//! let files = candle_vlm_lens::fetch_model_files("OpenGVLab/InternVL2_5-1B")?;
//! tracing::info!("weights: {:?}", files.weights);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{LensError, Result};

/// Name of the sharded-weights index file.
const INDEX_FILE: &str = "model.safetensors.index.json";
/// Name of the single-file weights.
const SINGLE_FILE: &str = "model.safetensors";

/// Local paths of a checkpoint's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// Safetensors files, one per shard, sorted by name.
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Read and parse `config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if the file cannot be read or parsed.
    pub fn read_config(&self) -> Result<serde_json::Value> {
        let text = std::fs::read_to_string(&self.config)
            .map_err(|e| LensError::Config(format!("read {}: {e}", self.config.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| LensError::Config(format!("parse {}: {e}", self.config.display())))
    }
}

/// Index structure for sharded safetensors models.
#[derive(Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

/// Unique shard filenames listed in an index file, sorted.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(index_path)
        .map_err(|e| LensError::Download(format!("read {}: {e}", index_path.display())))?;
    let index: SafetensorsIndex = serde_json::from_str(&text)
        .map_err(|e| LensError::Config(format!("parse {}: {e}", index_path.display())))?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Fetch a model's files from the hub, reusing the local cache.
///
/// Tries `model.safetensors.index.json` first (sharded), falls back to a
/// single `model.safetensors`.
///
/// # Errors
///
/// Returns [`LensError::Download`] if the hub cannot be reached or a
/// required file is missing from the repository.
pub fn fetch_model_files(model_id: &str) -> Result<ModelFiles> {
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| LensError::Download(format!("hub client: {e}")))?;
    let repo = api.model(model_id.to_owned());
    let get = |name: &str| {
        repo.get(name)
            .map_err(|e| LensError::Download(format!("{model_id}/{name}: {e}")))
    };

    let config = get("config.json")?;
    let tokenizer = get("tokenizer.json")?;
    let weights = match repo.get(INDEX_FILE) {
        Ok(index) => shard_names(&index)?
            .iter()
            .map(|name| get(name))
            .collect::<Result<Vec<_>>>()?,
        Err(_) => vec![get(SINGLE_FILE)?],
    };

    tracing::info!(model_id, shards = weights.len(), "resolved model files");
    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Resolve a model's files inside a local checkpoint directory.
///
/// # Errors
///
/// Returns [`LensError::Download`] if a required file does not exist.
pub fn local_model_files(dir: impl AsRef<Path>) -> Result<ModelFiles> {
    let dir = dir.as_ref();
    let existing = |name: &str| {
        let path = dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(LensError::Download(format!(
                "{} not found",
                path.display()
            )))
        }
    };

    let config = existing("config.json")?;
    let tokenizer = existing("tokenizer.json")?;
    let index = dir.join(INDEX_FILE);
    let weights = if index.is_file() {
        shard_names(&index)?
            .iter()
            .map(|name| existing(name))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![existing(SINGLE_FILE)?]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn local_single_file_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", r#"{"model_type": "internvl_chat"}"#);
        touch(dir.path(), "tokenizer.json", "{}");
        touch(dir.path(), SINGLE_FILE, "");

        let files = local_model_files(dir.path()).unwrap();
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_FILE)]);
        assert_eq!(
            files.read_config().unwrap()["model_type"],
            serde_json::json!("internvl_chat")
        );
    }

    #[test]
    fn local_sharded_checkpoint_dedups_shards() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        touch(
            dir.path(),
            INDEX_FILE,
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        );
        touch(dir.path(), "model-00001-of-00002.safetensors", "");
        touch(dir.path(), "model-00002-of-00002.safetensors", "");

        let files = local_model_files(dir.path()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn missing_files_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        let err = local_model_files(dir.path()).unwrap_err();
        assert!(matches!(err, LensError::Download(_)));
        assert!(err.to_string().contains("tokenizer.json"));
    }
}
