//! Root Mean Square normalization without learnable parameters.
//!
//! # Formula
//!
//! `RMSNorm(x) = x / sqrt(mean(x^2) + eps)`
//!
//! Every normalization in the stack uses this form: there is no scale or
//! bias anywhere, so checkpoints carry no norm weights.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::Result;
use candle_core::{DType, Tensor, D};

/// Small constant for numerical stability.
pub const RMS_NORM_EPS: f64 = 1e-5;

/// Normalize over the last dimension.
///
/// Statistics are computed in f32; the result has the input's dtype.
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;

    let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
    let rsqrt = (mean_sq + RMS_NORM_EPS)?.sqrt()?.recip()?;

    Ok(x.broadcast_mul(&rsqrt)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn preserves_shape() {
        let x = Tensor::randn(0.0f32, 1.0, (2, 16, 64), &Device::Cpu).unwrap();
        let y = rms_norm(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn rows_have_unit_mean_square() {
        let x = Tensor::randn(0.0f32, 3.0, (4, 8, 64), &Device::Cpu).unwrap();
        let y = rms_norm(&x).unwrap();

        let mean_sq: Vec<f32> = y
            .sqr()
            .unwrap()
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for value in mean_sq {
            assert!((value - 1.0).abs() < 1e-3, "mean square {value}");
        }
    }

    #[test]
    fn constant_input_normalizes_to_one() {
        // RMS of 2.0 repeated is 2.0, so every output is ~1.0
        let x = (Tensor::ones((1, 64), DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let values: Vec<f32> = rms_norm(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for value in values {
            assert!((value - 1.0).abs() < 1e-4, "expected ~1.0, got {value}");
        }
    }

    #[test]
    fn zero_input_stays_finite() {
        let x = Tensor::zeros((2, 32), DType::F32, &Device::Cpu).unwrap();
        let values: Vec<f32> = rms_norm(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn keeps_half_precision_dtype() {
        let x = Tensor::randn(0.0f32, 1.0, (2, 32), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        assert_eq!(rms_norm(&x).unwrap().dtype(), DType::BF16);
    }
}
