//! Next-token selection from logits.
//!
//! Strategies, in priority order:
//! - `temperature == 0`: argmax
//! - `top_k`: keep the `k` highest logits, then draw
//! - `top_p < 1`: keep the smallest high-probability prefix whose mass
//!   reaches `p` (the most likely token is always kept), then draw
//! - otherwise: draw from the full tempered distribution
//!
//! Logits are pulled to the host once per call; the draw itself runs on
//! plain `f64` vectors with [`rand`].

use crate::error::{NanochatError, Result};
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Softmax temperature. 0 selects the argmax.
    pub temperature: f64,
    /// Restrict the draw to the `k` most likely tokens.
    pub top_k: Option<usize>,
    /// Nucleus threshold. Ignored when `top_k` is set or when `>= 1`.
    pub top_p: Option<f64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k filtering.
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    /// Set top-p (nucleus) filtering.
    pub fn with_top_p(mut self, p: f64) -> Self {
        self.top_p = Some(p);
        self
    }

    /// Whether this selects the argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Reject values that cannot describe a distribution.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(NanochatError::InvalidSampling(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(NanochatError::InvalidSampling(
                "top_k must be at least 1".into(),
            ));
        }
        if let Some(p) = self.top_p {
            if !p.is_finite() || p < 0.0 {
                return Err(NanochatError::InvalidSampling(format!(
                    "top_p must be finite and non-negative, got {p}"
                )));
            }
        }
        Ok(())
    }
}

/// Draw one token id per row of `logits` (`[batch, vocab]` or `[vocab]`).
pub fn sample<R: Rng + ?Sized>(
    logits: &Tensor,
    params: &SamplingParams,
    rng: &mut R,
) -> Result<Vec<u32>> {
    params.validate()?;

    let logits = logits.to_dtype(DType::F32)?;
    let rows: Vec<Vec<f32>> = match logits.rank() {
        1 => vec![logits.to_vec1()?],
        2 => logits.to_vec2()?,
        _ => {
            return Err(NanochatError::Shape(format!(
                "sampling expects [batch, vocab] or [vocab] logits, got {:?}",
                logits.dims()
            )))
        }
    };

    rows.iter()
        .map(|row| sample_row(row, params, &mut *rng))
        .collect()
}

/// Select one id from a single row of logits.
pub fn sample_row<R: Rng + ?Sized>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(NanochatError::Shape("cannot sample from empty logits".into()));
    }
    if params.is_greedy() {
        return Ok(argmax(logits) as u32);
    }

    if let Some(k) = params.top_k {
        let mut candidates = descending_order(logits);
        candidates.truncate(k.min(logits.len()));

        let selected: Vec<f32> = candidates.iter().map(|&i| logits[i]).collect();
        let probs = softmax(&selected, params.temperature);
        let choice = draw(&probs, rng)?;
        return Ok(candidates[choice] as u32);
    }

    let probs = softmax(logits, params.temperature);
    match params.top_p {
        Some(p) if p < 1.0 => {
            let nucleus = nucleus(&probs, p);
            let mass: f64 = nucleus.iter().map(|&i| probs[i]).sum();
            let renormalized: Vec<f64> = nucleus.iter().map(|&i| probs[i] / mass).collect();
            let choice = draw(&renormalized, rng)?;
            Ok(nucleus[choice] as u32)
        }
        _ => Ok(draw(&probs, rng)? as u32),
    }
}

/// Index of the largest value; the first one wins ties.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Indices sorted by value, largest first. Stable for equal values.
fn descending_order<T: Copy + PartialOrd>(values: &[T]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Tempered softmax in f64.
fn softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((l as f64 - max) / temperature).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices kept by nucleus filtering, most likely first.
///
/// An entry is dropped when the cumulative probability up to and including
/// it exceeds `p`; the first entry is always kept.
fn nucleus(probs: &[f64], p: f64) -> Vec<usize> {
    let mut kept = Vec::new();
    let mut cumulative = 0.0;
    for idx in descending_order(probs) {
        cumulative += probs[idx];
        if !kept.is_empty() && cumulative > p {
            break;
        }
        kept.push(idx);
    }
    kept
}

fn draw<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Result<usize> {
    let dist = WeightedIndex::new(weights)
        .map_err(|e| NanochatError::InvalidSampling(format!("degenerate distribution: {e}")))?;
    Ok(dist.sample(rng))
}
