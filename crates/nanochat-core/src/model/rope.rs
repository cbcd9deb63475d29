//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating pairs of query and key
//! channels by a position-dependent angle. Channel `i` of the first half of a
//! head is paired with channel `i` of the second half.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{NanochatError, Result};
use crate::model::ModelConfig;
use candle_core::{DType, Device, Tensor};

/// Base of the frequency schedule.
pub const ROTARY_BASE: f64 = 10000.0;

/// Precomputed cosine/sine table shaped `[1, max_positions, 1, head_dim / 2]`.
///
/// The layout broadcasts directly against `[batch, seq, heads, head_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    cos: Tensor,
    sin: Tensor,
    head_dim: usize,
    max_positions: usize,
}

impl RotaryTable {
    /// Compute the table.
    ///
    /// # Arguments
    ///
    /// * `max_positions` - Number of positions to cover
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `base` - Base frequency
    /// * `device` - Device for the tables
    pub fn new(max_positions: usize, head_dim: usize, base: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(NanochatError::Shape(format!(
                "rotary head_dim must be even and positive, got {head_dim}"
            )));
        }

        // inv_freq[i] = 1 / base^(2i/d) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / base.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_positions).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_positions, 1), device)?;

        // angle[pos, i] = pos * inv_freq[i]
        let angles = positions.matmul(&inv_freq)?;

        let cos = angles.cos()?.reshape((1, max_positions, 1, half_dim))?;
        let sin = angles.sin()?.reshape((1, max_positions, 1, half_dim))?;

        Ok(Self {
            cos,
            sin,
            head_dim,
            max_positions,
        })
    }

    /// Table sized for `config` (`block_size * ROTARY_OVER_ALLOCATION` positions).
    pub fn for_config(config: &ModelConfig, device: &Device) -> Result<Self> {
        Self::new(
            config.rotary_positions(),
            config.head_dim(),
            ROTARY_BASE,
            device,
        )
    }

    /// `(cos, sin)` for positions `start..start + len`.
    pub fn slice(&self, start: usize, len: usize) -> Result<(Tensor, Tensor)> {
        let end = start + len;
        if end > self.max_positions {
            return Err(NanochatError::SequenceTooLong {
                len: end,
                max: self.max_positions,
            });
        }
        Ok((self.cos.narrow(1, start, len)?, self.sin.narrow(1, start, len)?))
    }

    /// Full cosine table.
    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Full sine table.
    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Number of positions covered.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Head dimension the table was built for.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Device the table lives on.
    pub fn device(&self) -> &Device {
        self.cos.device()
    }
}

/// Rotate `x` (`[batch, seq, heads, head_dim]`) by the given angles.
///
/// `cos`/`sin` must broadcast against `[batch, seq, heads, head_dim / 2]`.
/// The rotation runs in f32 and the result is cast back to `x`'s dtype.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    if x.rank() != 4 {
        return Err(NanochatError::Shape(format!(
            "apply_rotary expects [batch, seq, heads, head_dim], got {:?}",
            x.dims()
        )));
    }
    let head_dim = x.dim(3)?;
    if head_dim % 2 != 0 {
        return Err(NanochatError::Shape(format!(
            "apply_rotary needs an even head_dim, got {head_dim}"
        )));
    }
    let half_dim = head_dim / 2;
    let dtype = x.dtype();

    let x = x.to_dtype(DType::F32)?;
    let cos = cos.to_dtype(DType::F32)?;
    let sin = sin.to_dtype(DType::F32)?;

    let x1 = x.narrow(3, 0, half_dim)?;
    let x2 = x.narrow(3, half_dim, half_dim)?;

    // [x1, x2] -> [x1*cos + x2*sin, x2*cos - x1*sin]
    let y1 = (x1.broadcast_mul(&cos)? + x2.broadcast_mul(&sin)?)?;
    let y2 = (x2.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;

    Ok(Tensor::cat(&[y1, y2], 3)?.to_dtype(dtype)?)
}
