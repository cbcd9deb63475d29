//! GPT transformer stack.
//!
//! `idx -> wte -> norm -> blocks -> norm -> lm_head -> softcap`
//!
//! The same forward pass serves training (full sequence, causal mask,
//! optional loss) and incremental decoding (a few new tokens appended to a
//! [`KvCache`]).

use super::{rms_norm, Block, Checkpoint, KvCache, ModelConfig, RotaryTable};
use crate::error::{NanochatError, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, Module, VarBuilder, VarMap};
use std::collections::HashMap;

/// Logits are squashed into `(-LOGIT_SOFTCAP, LOGIT_SOFTCAP)`.
pub const LOGIT_SOFTCAP: f64 = 15.0;

/// Target value excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Result of [`Gpt::forward`].
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// Softcapped logits [batch, seq_len, vocab_size] in f32.
    Logits(Tensor),
    /// Mean cross-entropy over non-ignored targets (scalar).
    Loss(Tensor),
}

impl ModelOutput {
    /// Unwrap the logits variant.
    pub fn into_logits(self) -> Result<Tensor> {
        match self {
            Self::Logits(logits) => Ok(logits),
            Self::Loss(_) => Err(NanochatError::State(
                "forward returned a loss, expected logits".into(),
            )),
        }
    }

    /// Unwrap the loss variant.
    pub fn into_loss(self) -> Result<Tensor> {
        match self {
            Self::Loss(loss) => Ok(loss),
            Self::Logits(_) => Err(NanochatError::State(
                "forward returned logits, expected a loss".into(),
            )),
        }
    }
}

/// Decoder-only GPT model.
#[derive(Debug, Clone)]
pub struct Gpt {
    config: ModelConfig,
    /// Token embedding: [vocab_size, n_embd]
    wte: Embedding,
    blocks: Vec<Block>,
    /// Output head: [vocab_size, n_embd]
    lm_head: Linear,
    rotary: RotaryTable,
    dtype: DType,
}

impl Gpt {
    /// Build the model from `vb`.
    ///
    /// The config is validated before any weight is requested.
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let dtype = vb.dtype();

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("transformer.wte"))?;
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&config, i, vb.pp(format!("transformer.h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = linear_no_bias(config.n_embd, config.vocab_size, vb.pp("lm_head"))?;
        let rotary = RotaryTable::for_config(&config, &device)?;

        Ok(Self {
            config,
            wte,
            blocks,
            lm_head,
            rotary,
            dtype,
        })
    }

    /// Create a model with freshly initialised f32 weights (for testing and demos).
    pub fn random(config: ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        Self::new(config, VarBuilder::from_varmap(&varmap, DType::F32, device))
    }

    /// Build the model from checkpoint weights, keeping their dtype.
    pub fn from_checkpoint(checkpoint: &Checkpoint, device: &Device) -> Result<Self> {
        let dtype = checkpoint
            .weights
            .get("lm_head.weight")
            .map_or(DType::F32, Tensor::dtype);
        let vb = VarBuilder::from_tensors(checkpoint.weights.clone(), dtype, device);
        Self::new(checkpoint.config, vb)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `idx` - Token ids [batch, seq_len]
    /// * `targets` - Next-token ids [batch, seq_len]; `IGNORE_INDEX` entries
    ///   are skipped. When given, the loss is returned instead of logits.
    /// * `cache` - KV cache; new tokens are placed after its current position
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
    ) -> Result<ModelOutput> {
        if idx.rank() != 2 {
            return Err(NanochatError::Shape(format!(
                "idx must be [batch, seq_len], got {:?}",
                idx.dims()
            )));
        }
        if !idx.device().same_device(self.rotary.device()) {
            return Err(NanochatError::DeviceMismatch(format!(
                "idx is on {:?}, model is on {:?}",
                idx.device(),
                self.rotary.device()
            )));
        }
        if let Some(cache) = cache.as_deref() {
            if cache.num_layers() != self.blocks.len() {
                return Err(NanochatError::State(format!(
                    "cache has {} layers, model has {}",
                    cache.num_layers(),
                    self.blocks.len()
                )));
            }
        }

        let (_, seq_len) = idx.dims2()?;
        let start = cache.as_deref().map_or(0, KvCache::position);
        let (cos, sin) = self.rotary.slice(start, seq_len)?;

        let mut x = rms_norm(&self.wte.forward(idx)?)?;
        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, cache.as_deref_mut())?;
        }
        let x = rms_norm(&x)?;

        let logits = self.lm_head.forward(&x)?.to_dtype(DType::F32)?;
        let logits = softcap(&logits)?;

        match targets {
            Some(targets) => Ok(ModelOutput::Loss(masked_cross_entropy(
                &logits, targets, idx,
            )?)),
            None => Ok(ModelOutput::Logits(logits)),
        }
    }

    /// Logits for `idx` [batch, seq_len, vocab_size].
    pub fn logits(&self, idx: &Tensor, cache: Option<&mut KvCache>) -> Result<Tensor> {
        self.forward(idx, None, cache)?.into_logits()
    }

    /// Mean cross-entropy of `targets` given `idx` (full causal pass).
    pub fn loss(&self, idx: &Tensor, targets: &Tensor) -> Result<Tensor> {
        self.forward(idx, Some(targets), None)?.into_loss()
    }

    /// Every weight tensor keyed by its checkpoint name.
    pub fn named_weights(&self) -> HashMap<String, Tensor> {
        let mut weights = HashMap::new();
        weights.insert(
            "transformer.wte.weight".to_string(),
            self.wte.embeddings().clone(),
        );
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_weights(&format!("transformer.h.{i}"), &mut weights);
        }
        weights.insert("lm_head.weight".to_string(), self.lm_head.weight().clone());
        weights
    }

    /// Total number of parameters.
    pub fn num_parameters(&self) -> usize {
        self.named_weights().values().map(Tensor::elem_count).sum()
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get the rotary table.
    pub fn rotary(&self) -> &RotaryTable {
        &self.rotary
    }

    /// Get the transformer blocks.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        self.rotary.device()
    }

    /// Dtype of the weights (and of KV cache entries).
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// `LOGIT_SOFTCAP * tanh(logits / LOGIT_SOFTCAP)`
fn softcap(logits: &Tensor) -> Result<Tensor> {
    Ok(((logits / LOGIT_SOFTCAP)?.tanh()? * LOGIT_SOFTCAP)?)
}

/// Mean negative log-likelihood over targets that are not `IGNORE_INDEX`.
///
/// With every target ignored the mean is taken over zero entries and the
/// result is NaN.
fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, idx: &Tensor) -> Result<Tensor> {
    if targets.dims() != idx.dims() {
        return Err(NanochatError::Shape(format!(
            "targets {:?} must match idx {:?}",
            targets.dims(),
            idx.dims()
        )));
    }
    let vocab_size = logits.dim(D::Minus1)?;
    let ids: Vec<i64> = targets.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;

    let mut gather_ids = Vec::with_capacity(ids.len());
    let mut weights = Vec::with_capacity(ids.len());
    for &id in &ids {
        if id == IGNORE_INDEX {
            gather_ids.push(0u32);
            weights.push(0.0f32);
        } else if (0..vocab_size as i64).contains(&id) {
            gather_ids.push(id as u32);
            weights.push(1.0);
        } else {
            return Err(NanochatError::Shape(format!(
                "target id {id} outside vocabulary of {vocab_size}"
            )));
        }
    }
    let count = weights.iter().filter(|w| **w > 0.0).count();

    let device = logits.device();
    let n = ids.len();
    let gather_ids = Tensor::from_vec(gather_ids, (n, 1), device)?;
    let weights = Tensor::from_vec(weights, n, device)?;

    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((n, vocab_size))?, D::Minus1)?;
    let picked = log_probs.gather(&gather_ids, 1)?.squeeze(1)?;
    let total = (picked * weights)?.sum_all()?.neg()?;

    Ok((total / count as f64)?)
}
