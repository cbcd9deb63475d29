//! Squared-ReLU MLP.
//!
//! # Formula
//!
//! `MLP(x) = relu(x @ c_fc^T)^2 @ c_proj^T`
//!
//! The hidden layer is four times the embedding width. Neither projection
//! has a bias.
//!
//! # Reference
//!
//! [Primer: Searching for Efficient Transformers for Language Modeling](https://arxiv.org/abs/2109.08668)

use crate::error::Result;
use crate::model::ModelConfig;
use candle_core::Tensor;
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use std::collections::HashMap;

/// Hidden width multiplier.
pub const MLP_EXPANSION: usize = 4;

/// Feed-forward block.
#[derive(Debug, Clone)]
pub struct Mlp {
    /// Up projection: [4 * n_embd, n_embd]
    c_fc: Linear,
    /// Down projection: [n_embd, 4 * n_embd]
    c_proj: Linear,
    hidden_size: usize,
    intermediate_size: usize,
}

impl Mlp {
    /// Build from `vb` (`c_fc`, `c_proj`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.n_embd;
        let intermediate_size = MLP_EXPANSION * hidden_size;
        Ok(Self {
            c_fc: linear_no_bias(hidden_size, intermediate_size, vb.pp("c_fc"))?,
            c_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("c_proj"))?,
            hidden_size,
            intermediate_size,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., n_embd]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.relu()?.sqr()?;
        Ok(self.c_proj.forward(&hidden)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    pub(crate) fn collect_weights(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        out.insert(format!("{prefix}.c_fc.weight"), self.c_fc.weight().clone());
        out.insert(format!("{prefix}.c_proj.weight"), self.c_proj.weight().clone());
    }
}
