// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Storage and accumulation precision.
//!
//! Every running sum in the normalization passes is kept in a type at least
//! as wide as `f32`. Half-precision storage types are widened on load and
//! narrowed once, on the final store.
//!
//! | Storage | Accumulator |
//! |---------|-------------|
//! | `f16`   | `f32`       |
//! | `bf16`  | `f32`       |
//! | `f32`   | `f32`       |
//! | `f64`   | `f64`       |

use std::fmt::Debug;
use std::ops::AddAssign;

use candle_core::{DType, WithDType};
use half::{bf16, f16};
use num_traits::Float;

use crate::error::{LayerNormError, Result};

/// Wide floating type used for running sums and per-row statistics.
pub trait Accumulator: Float + AddAssign + Send + Sync + Debug + 'static {
    /// Convert an element count.
    fn from_count(n: usize) -> Self;

    /// Convert an epsilon given in `f64`.
    fn from_eps(eps: f64) -> Self;
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
impl Accumulator for f32 {
    fn from_count(n: usize) -> Self {
        n as f32
    }

    fn from_eps(eps: f64) -> Self {
        eps as f32
    }
}

#[allow(clippy::cast_precision_loss)]
impl Accumulator for f64 {
    fn from_count(n: usize) -> Self {
        n as f64
    }

    fn from_eps(eps: f64) -> Self {
        eps
    }
}

/// Storage element type accepted by the kernels.
///
/// The accumulator type is fixed per element type, so a pass picks its
/// working precision once, at monomorphization.
pub trait NormElement: WithDType {
    /// Accumulator paired with this storage type.
    type Acc: Accumulator;

    /// Widen a stored value.
    fn to_acc(self) -> Self::Acc;

    /// Narrow an accumulated value for storage.
    fn from_acc(acc: Self::Acc) -> Self;
}

impl NormElement for f16 {
    type Acc = f32;

    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    fn from_acc(acc: f32) -> Self {
        f16::from_f32(acc)
    }
}

impl NormElement for bf16 {
    type Acc = f32;

    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    fn from_acc(acc: f32) -> Self {
        bf16::from_f32(acc)
    }
}

impl NormElement for f32 {
    type Acc = f32;

    fn to_acc(self) -> f32 {
        self
    }

    fn from_acc(acc: f32) -> Self {
        acc
    }
}

impl NormElement for f64 {
    type Acc = f64;

    fn to_acc(self) -> f64 {
        self
    }

    fn from_acc(acc: f64) -> Self {
        acc
    }
}

/// Accumulator dtype used for a storage dtype.
///
/// # Errors
/// Returns [`LayerNormError::UnsupportedDType`] for non-floating dtypes.
pub fn accumulator_dtype(dtype: DType) -> Result<DType> {
    match dtype {
        DType::F16 | DType::BF16 | DType::F32 => Ok(DType::F32),
        DType::F64 => Ok(DType::F64),
        other => Err(LayerNormError::UnsupportedDType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_types_widen_to_f32() {
        let x = f16::from_f32(0.1);
        let wide: f32 = x.to_acc();
        assert!((wide - 0.1).abs() < 1e-3);
        assert_eq!(bf16::from_acc(2.0f32).to_f32(), 2.0);
    }

    #[test]
    fn test_accumulator_dtype() {
        assert_eq!(accumulator_dtype(DType::F16).unwrap(), DType::F32);
        assert_eq!(accumulator_dtype(DType::BF16).unwrap(), DType::F32);
        assert_eq!(accumulator_dtype(DType::F32).unwrap(), DType::F32);
        assert_eq!(accumulator_dtype(DType::F64).unwrap(), DType::F64);
        assert!(matches!(
            accumulator_dtype(DType::U32),
            Err(LayerNormError::UnsupportedDType(DType::U32))
        ));
    }

    #[test]
    fn test_half_accumulation_beats_narrow_sum() {
        // 4096 * 0.01 in f16 stalls well before 40.96
        let value = f16::from_f32(0.01);
        let mut narrow = f16::from_f32(0.0);
        let mut wide = 0.0f32;
        for _ in 0..4096 {
            narrow += value;
            wide += value.to_acc();
        }
        assert!((wide - 40.96).abs() < 0.1);
        assert!((narrow.to_f32() - 40.96).abs() > 1.0);
    }
}
