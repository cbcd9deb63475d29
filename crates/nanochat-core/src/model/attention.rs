//! Causal self-attention with rotary embeddings, QK norm, grouped-query
//! expansion and an optional KV cache.

use super::{apply_rotary, rms_norm, KvCache, ModelConfig};
use crate::error::{NanochatError, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use std::collections::HashMap;

/// Which key positions each query may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionMask {
    /// Every query sees every key. Used for a single new query against the
    /// cache, where all cached positions precede it.
    None,
    /// Query `i` sees keys `0..=i` (full-sequence pass).
    Causal,
    /// The first `prefix_len` keys are visible to every query; among the new
    /// positions query `i` sees new keys `0..=i`.
    PrefixCausal {
        /// Number of already cached positions.
        prefix_len: usize,
    },
}

impl AttentionMask {
    /// Pick the mask for `num_queries` new queries against `num_keys` keys.
    pub fn select(num_queries: usize, num_keys: usize) -> Result<Self> {
        if num_keys < num_queries {
            return Err(NanochatError::State(format!(
                "{num_keys} keys cannot cover {num_queries} queries"
            )));
        }
        Ok(if num_queries == 1 {
            Self::None
        } else if num_queries == num_keys {
            Self::Causal
        } else {
            Self::PrefixCausal {
                prefix_len: num_keys - num_queries,
            }
        })
    }

    /// Additive mask `[1, 1, num_queries, num_keys]` with `-inf` on hidden
    /// positions, or `None` when nothing is hidden.
    pub fn to_tensor(
        &self,
        num_queries: usize,
        num_keys: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        let prefix_len = match *self {
            Self::None => return Ok(None),
            Self::Causal => 0,
            Self::PrefixCausal { prefix_len } => prefix_len,
        };

        let mask: Vec<f32> = (0..num_queries)
            .flat_map(|i| {
                (0..num_keys).map(move |j| {
                    if j <= prefix_len + i {
                        0.0
                    } else {
                        f32::NEG_INFINITY
                    }
                })
            })
            .collect();
        let mask = Tensor::from_vec(mask, (1, 1, num_queries, num_keys), device)?;
        Ok(Some(mask))
    }
}

/// Self-attention for one transformer layer.
#[derive(Debug, Clone)]
pub struct CausalSelfAttention {
    /// Query projection: [n_head * head_dim, n_embd]
    c_q: Linear,
    /// Key projection: [n_kv_head * head_dim, n_embd]
    c_k: Linear,
    /// Value projection: [n_kv_head * head_dim, n_embd]
    c_v: Linear,
    /// Output projection: [n_embd, n_embd]
    c_proj: Linear,
    n_head: usize,
    n_kv_head: usize,
    head_dim: usize,
    n_embd: usize,
    /// Index used to address the KV cache.
    layer_idx: usize,
}

impl CausalSelfAttention {
    /// Build the projections from `vb` (`c_q`, `c_k`, `c_v`, `c_proj`).
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let n_embd = config.n_embd;
        Ok(Self {
            c_q: linear_no_bias(n_embd, config.n_head * head_dim, vb.pp("c_q"))?,
            c_k: linear_no_bias(n_embd, config.n_kv_head * head_dim, vb.pp("c_k"))?,
            c_v: linear_no_bias(n_embd, config.n_kv_head * head_dim, vb.pp("c_v"))?,
            c_proj: linear_no_bias(n_embd, n_embd, vb.pp("c_proj"))?,
            n_head: config.n_head,
            n_kv_head: config.n_kv_head,
            head_dim,
            n_embd,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Normalized hidden states [batch, seq_len, n_embd]
    /// * `cos`, `sin` - Rotary angles for this step's positions
    /// * `cache` - KV cache to append to and read from
    ///
    /// # Returns
    ///
    /// Attention output [batch, seq_len, n_embd]
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        if x.rank() != 3 {
            return Err(NanochatError::Shape(format!(
                "attention expects [batch, seq, n_embd], got {:?}",
                x.dims()
            )));
        }
        let (batch, seq_len, _) = x.dims3()?;

        let q = self
            .c_q
            .forward(x)?
            .reshape((batch, seq_len, self.n_head, self.head_dim))?;
        let k = self
            .c_k
            .forward(x)?
            .reshape((batch, seq_len, self.n_kv_head, self.head_dim))?;
        let v = self
            .c_v
            .forward(x)?
            .reshape((batch, seq_len, self.n_kv_head, self.head_dim))?;

        // Rotate, then QK norm
        let q = rms_norm(&apply_rotary(&q, cos, sin)?)?;
        let k = rms_norm(&apply_rotary(&k, cos, sin)?)?;

        // [batch, heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let (k, v) = match cache {
            Some(cache) => cache.insert(self.layer_idx, &k, &v)?,
            None => (k, v),
        };
        let num_keys = k.dim(2)?;

        let group = self.n_head / self.n_kv_head;
        let k = repeat_kv(&k, group)?.contiguous()?;
        let v = repeat_kv(&v, group)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;

        let mask = AttentionMask::select(seq_len, num_keys)?;
        let scores = match mask.to_tensor(seq_len, num_keys, scores.device())? {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?,
            None => scores,
        };

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = weights.matmul(&v)?;

        // [batch, seq, n_embd]
        let y = y.transpose(1, 2)?.reshape((batch, seq_len, self.n_embd))?;
        Ok(self.c_proj.forward(&y)?)
    }

    /// Index of the layer this module belongs to.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Number of query heads.
    pub fn num_heads(&self) -> usize {
        self.n_head
    }

    /// Number of key/value heads.
    pub fn num_kv_heads(&self) -> usize {
        self.n_kv_head
    }

    pub(crate) fn collect_weights(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        for (name, linear) in [
            ("c_q", &self.c_q),
            ("c_k", &self.c_k),
            ("c_v", &self.c_v),
            ("c_proj", &self.c_proj),
        ] {
            out.insert(format!("{prefix}.{name}.weight"), linear.weight().clone());
        }
    }
}

/// Repeat each KV head `repeat` times along the head axis.
///
/// `[batch, n_kv_head, seq, head_dim]` -> `[batch, n_kv_head * repeat, seq, head_dim]`,
/// with copies of a head kept adjacent so query head `h` reads KV head
/// `h / repeat`.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?;
    Ok(x)
}
