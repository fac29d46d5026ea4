// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for layernorm-rs.

use candle_core::DType;
use thiserror::Error;

/// Result type alias for layernorm-rs operations.
pub type Result<T> = std::result::Result<T, LayerNormError>;

/// Errors that can occur in layernorm-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LayerNormError {
    /// A flat buffer does not hold the element count its role requires.
    #[error("buffer `{buffer}` has {actual} elements, expected {expected}")]
    BufferLength {
        /// Buffer name (`x`, `scale`, `mean`, ...)
        buffer: &'static str,
        /// Required element count
        expected: usize,
        /// Provided element count
        actual: usize,
    },

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Inputs carry different dtypes.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        actual: DType,
    },

    /// Element dtype outside the supported floating set.
    #[error("unsupported dtype: {0:?}")]
    UnsupportedDType(DType),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// GPU kernel error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Device not available.
    #[error("device not available: {0}")]
    DeviceNotAvailable(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
