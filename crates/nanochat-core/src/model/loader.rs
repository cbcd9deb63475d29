//! SafeTensors checkpoint I/O.
//!
//! A checkpoint is a single `.safetensors` file. Weights use the nanochat
//! names (`transformer.wte.weight`, `transformer.h.{i}.attn.c_q.weight`, ...,
//! `lm_head.weight`). The model config is stored as JSON under the
//! [`CONFIG_METADATA_KEY`] metadata entry; any other metadata entries are
//! carried through untouched.
//!
//! # Example
//!
//! ```ignore
//! use nanochat_core::model::{Checkpoint, Gpt};
//!
//! let checkpoint = Checkpoint::load(Path::new("model.safetensors"), &Device::Cpu)?;
//! let model = Gpt::from_checkpoint(&checkpoint, &Device::Cpu)?;
//! ```

use super::{Gpt, ModelConfig};
use crate::error::{NanochatError, Result};
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Metadata entry holding the JSON-encoded [`ModelConfig`].
pub const CONFIG_METADATA_KEY: &str = "config";

/// Weights, config and free-form metadata of a saved model.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Tensors indexed by name.
    pub weights: HashMap<String, Tensor>,
    /// Model architecture.
    pub config: ModelConfig,
    /// Extra string metadata (step, run name, ...).
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    /// Create a checkpoint without extra metadata.
    pub fn new(weights: HashMap<String, Tensor>, config: ModelConfig) -> Self {
        Self {
            weights,
            config,
            metadata: BTreeMap::new(),
        }
    }

    /// Snapshot the current weights of `model`.
    pub fn from_model(model: &Gpt) -> Self {
        Self::new(model.named_weights(), *model.config())
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Load a checkpoint file onto `device`.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(NanochatError::not_found(path));
        }
        let data = fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| {
            NanochatError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut metadata: BTreeMap<String, String> = header
            .metadata()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let config_json = metadata.remove(CONFIG_METADATA_KEY).ok_or_else(|| {
            NanochatError::Checkpoint(format!(
                "{} has no `{CONFIG_METADATA_KEY}` metadata entry",
                path.display()
            ))
        })?;
        let config = ModelConfig::from_json_str(&config_json)?;

        let weights = candle_core::safetensors::load_buffer(&data, device)?;

        tracing::debug!(
            path = %path.display(),
            tensors = weights.len(),
            "loaded checkpoint"
        );

        Ok(Self {
            weights,
            config,
            metadata,
        })
    }

    /// Write the checkpoint to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut metadata: HashMap<String, String> = self.metadata.clone().into_iter().collect();
        metadata.insert(
            CONFIG_METADATA_KEY.to_string(),
            self.config.to_json_string()?,
        );

        safetensors::serialize_to_file(
            self.weights.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            &Some(metadata),
            path,
        )
        .map_err(|e| {
            NanochatError::Checkpoint(format!("failed to write {}: {e}", path.display()))
        })?;

        tracing::debug!(
            path = %path.display(),
            tensors = self.weights.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Get all tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.weights.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of tensors.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Check if the checkpoint holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("nanochat_loader_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn tiny_model() -> Gpt {
        let config = ModelConfig::new(64, 16, 16, 2, 1, 1).unwrap();
        Gpt::random(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn save_and_load_preserve_everything() {
        let dir = scratch_dir("round_trip");
        let path = dir.join("nested").join("model.safetensors");

        let model = tiny_model();
        let checkpoint = Checkpoint::from_model(&model)
            .with_metadata("step", "1200")
            .with_metadata("run", "d20");
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.config, *model.config());
        assert_eq!(loaded.metadata.get("step").map(String::as_str), Some("1200"));
        assert_eq!(loaded.metadata.get("run").map(String::as_str), Some("d20"));
        assert!(!loaded.metadata.contains_key(CONFIG_METADATA_KEY));
        assert_eq!(loaded.tensor_names(), checkpoint.tensor_names());

        for (name, tensor) in &checkpoint.weights {
            let a: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = loaded.weights[name].flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b, "tensor {name} changed");
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_not_found() {
        let path = Path::new("/nonexistent/model.safetensors");
        match Checkpoint::load(path, &Device::Cpu).unwrap_err() {
            NanochatError::NotFound { path: p } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn directory_is_io_error() {
        let dir = scratch_dir("directory");
        fs::create_dir_all(&dir).unwrap();

        let err = Checkpoint::load(&dir, &Device::Cpu).unwrap_err();
        assert!(matches!(err, NanochatError::Io(_)));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_config_metadata() {
        let dir = scratch_dir("no_config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.safetensors");

        let tensor = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        safetensors::serialize_to_file([("w", &tensor)], &None, &path).unwrap();

        let err = Checkpoint::load(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, NanochatError::Checkpoint(_)));

        let _ = fs::remove_dir_all(&dir);
    }

    fn load_with_raw_config(name: &str, config: &str) -> Checkpoint {
        let dir = scratch_dir(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("legacy.safetensors");

        let metadata = HashMap::from([(CONFIG_METADATA_KEY.to_string(), config.to_string())]);
        let tensor = Tensor::zeros((64, 16), DType::F32, &Device::Cpu).unwrap();
        safetensors::serialize_to_file(
            [("transformer.wte.weight", &tensor)],
            &Some(metadata),
            &path,
        )
        .unwrap();

        let loaded = Checkpoint::load(&path, &Device::Cpu).unwrap();
        let _ = fs::remove_dir_all(&dir);
        loaded
    }

    #[test]
    fn sequence_len_metadata_accepted() {
        let config = r#"{"vocab_size":64,"sequence_len":32,"n_embd":16,"n_head":2,"n_kv_head":2,"n_layer":1}"#;
        let loaded = load_with_raw_config("legacy", config);
        assert_eq!(loaded.config.block_size, 32);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.metadata.is_empty());
    }

    #[test]
    fn block_size_metadata_preferred() {
        let config = r#"{"vocab_size":64,"block_size":16,"sequence_len":32,"n_embd":16,"n_head":2,"n_kv_head":2,"n_layer":1}"#;
        let loaded = load_with_raw_config("both_lengths", config);
        assert_eq!(loaded.config.block_size, 16);
    }
}
