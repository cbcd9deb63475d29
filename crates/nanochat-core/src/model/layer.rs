//! Transformer block.
//!
//! A single pre-norm decoder block:
//! - `x = x + attn(norm(x))`
//! - `x = x + mlp(norm(x))`

use super::{rms_norm, CausalSelfAttention, KvCache, Mlp, ModelConfig};
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use std::collections::HashMap;

/// One decoder block.
#[derive(Debug, Clone)]
pub struct Block {
    attn: CausalSelfAttention,
    mlp: Mlp,
    layer_idx: usize,
}

impl Block {
    /// Build block `layer_idx` from `vb` (`attn.*`, `mlp.*`).
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: CausalSelfAttention::new(config, layer_idx, vb.pp("attn"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Hidden states [batch, seq_len, n_embd]
    /// * `cos`, `sin` - Rotary angles for this step's positions
    /// * `cache` - Optional KV cache shared by all blocks
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let attn_output = self.attn.forward(&rms_norm(x)?, cos, sin, cache)?;
        let x = (x + attn_output)?;

        let mlp_output = self.mlp.forward(&rms_norm(&x)?)?;
        Ok((x + mlp_output)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attn
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    pub(crate) fn collect_weights(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        self.attn.collect_weights(&format!("{prefix}.attn"), out);
        self.mlp.collect_weights(&format!("{prefix}.mlp"), out);
    }
}
