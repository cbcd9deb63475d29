//! Generation engine plus a builder that loads it from disk.

use anyhow::{Context, Result};
use candle_core::Device;
use nanochat_core::model::{Checkpoint, Gpt, TextTokenizer, Tokenizer};
use std::path::PathBuf;

pub use nanochat_core::engine::{Engine, EngineConfig, GeneratedToken, Prompt, TokenStream};

/// Builder for creating an [`Engine`] from a checkpoint file and a tokenizer
/// directory.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    checkpoint: Option<PathBuf>,
    tokenizer_dir: Option<PathBuf>,
    device: Device,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder (CPU, entropy-seeded).
    pub fn new() -> Self {
        Self {
            checkpoint: None,
            tokenizer_dir: None,
            device: Device::Cpu,
            config: EngineConfig::default(),
        }
    }

    /// Set the `.safetensors` checkpoint path.
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Set the directory holding `tokenizer.json`.
    ///
    /// Defaults to the checkpoint's directory.
    pub fn tokenizer_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_dir = Some(path.into());
        self
    }

    /// Set the device the model runs on.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Seed the sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Override the end-of-sequence id.
    pub fn eos_token_id(mut self, id: u32) -> Self {
        self.config.eos_token_id = Some(id);
        self
    }

    /// Load the checkpoint and tokenizer and build the engine.
    pub fn build(self) -> Result<Engine<Tokenizer>> {
        let checkpoint_path = self
            .checkpoint
            .context("no checkpoint path given to EngineBuilder")?;
        let tokenizer_dir = match self.tokenizer_dir {
            Some(dir) => dir,
            None => checkpoint_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default(),
        };

        let checkpoint = Checkpoint::load(&checkpoint_path, &self.device)
            .with_context(|| format!("loading checkpoint {}", checkpoint_path.display()))?;
        let model = Gpt::from_checkpoint(&checkpoint, &self.device)
            .with_context(|| format!("building model from {}", checkpoint_path.display()))?;
        let tokenizer = Tokenizer::from_dir(&tokenizer_dir)
            .with_context(|| format!("loading tokenizer from {}", tokenizer_dir.display()))?;

        if tokenizer.vocab_size() > model.config().vocab_size {
            tracing::warn!(
                tokenizer = tokenizer.vocab_size(),
                model = model.config().vocab_size,
                "tokenizer vocabulary is larger than the model's"
            );
        }
        tracing::info!(
            checkpoint = %checkpoint_path.display(),
            layers = model.config().n_layer,
            params = model.num_parameters(),
            "engine ready"
        );

        Ok(Engine::new(model, tokenizer, self.config))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
