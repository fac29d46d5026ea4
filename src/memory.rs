// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Workspace estimates for the forward and backward passes.
//!
//! Counts the buffers a call allocates: outputs, per-row statistics, and the
//! transient per-row `ds`, `db`, `c1`, `c2` of the input-gradient chain.
//! Per-worker lane scratch is bounded by [`LayerNormConfig::shared_memory_bytes`]
//! and not included.
//!
//! [`LayerNormConfig::shared_memory_bytes`]: crate::kernels::LayerNormConfig::shared_memory_bytes

use candle_core::DType;

use crate::error::Result;
use crate::kernels::GradientMask;
use crate::precision::accumulator_dtype;

/// Transient per-row accumulator buffers of the input-gradient chain.
const BACKWARD_ROW_TEMPORARIES: usize = 4;

/// Bytes allocated by a forward call on an `m × n` input.
///
/// `y` in the storage dtype plus `mean` and `rstd` in the accumulator dtype.
///
/// # Errors
/// Returns [`crate::LayerNormError::UnsupportedDType`] for non-floating dtypes.
pub fn estimate_forward_bytes(m: usize, n: usize, dtype: DType) -> Result<usize> {
    let acc = accumulator_dtype(dtype)?.size_in_bytes();
    Ok(m * n * dtype.size_in_bytes() + 2 * m * acc)
}

/// Bytes allocated by a backward call producing the gradients in `mask`.
///
/// # Errors
/// Returns [`crate::LayerNormError::UnsupportedDType`] for non-floating dtypes.
pub fn estimate_backward_bytes(
    m: usize,
    n: usize,
    dtype: DType,
    mask: GradientMask,
) -> Result<usize> {
    let elem = dtype.size_in_bytes();
    let acc = accumulator_dtype(dtype)?.size_in_bytes();

    let mut bytes = 0;
    if mask.dx {
        bytes += m * n * elem + BACKWARD_ROW_TEMPORARIES * m * acc;
    }
    if mask.dscale {
        bytes += n * elem;
    }
    if mask.dshift {
        bytes += n * elem;
    }
    Ok(bytes)
}

/// Format bytes as human-readable string.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_estimate() {
        // 8 * 1024 f16 outputs + 2 * 8 f32 stats
        let bytes = estimate_forward_bytes(8, 1024, DType::F16).unwrap();
        assert_eq!(bytes, 8 * 1024 * 2 + 2 * 8 * 4);
        assert!(estimate_forward_bytes(8, 1024, DType::U8).is_err());
    }

    #[test]
    fn test_backward_estimate_follows_mask() {
        let all = estimate_backward_bytes(16, 256, DType::F32, GradientMask::ALL).unwrap();
        let params = estimate_backward_bytes(16, 256, DType::F32, GradientMask::PARAMS).unwrap();
        assert_eq!(params, 2 * 256 * 4);
        assert_eq!(all, params + 16 * 256 * 4 + 4 * 16 * 4);
        let none = GradientMask {
            dx: false,
            dscale: false,
            dshift: false,
        };
        assert_eq!(estimate_backward_bytes(16, 256, DType::F64, none).unwrap(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}
