// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host buffer ↔ `CubeCL` byte conversion.
//!
//! `CubeCL` handles are created from little-endian byte vectors via
//! `client.create(Bytes)` and read back with `client.read_one(handle)`.
//! These helpers do the `f32` packing on both ends and check that a
//! read-back buffer holds the element count the caller expects.

use crate::error::{LayerNormError, Result};

/// Width of one `f32` element in a device buffer.
pub const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Check if `CubeCL` CUDA runtime support is available.
///
/// `true` only when the crate was built with the `cuda` feature and Candle
/// can open CUDA device 0.
///
/// # Example
///
/// ```rust
/// use layernorm_rs::kernels::cubecl::has_cubecl_cuda_support;
///
/// if !has_cubecl_cuda_support() {
///     println!("running the host kernels");
/// }
/// ```
#[must_use]
pub fn has_cubecl_cuda_support() -> bool {
    #[cfg(feature = "cuda")]
    {
        matches!(
            candle_core::Device::cuda_if_available(0),
            Ok(candle_core::Device::Cuda(_))
        )
    }

    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

/// Pack `f32` values for `client.create`.
#[must_use]
pub fn f32_to_cubecl_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Unpack a read-back buffer of exactly `expected` `f32` values.
///
/// # Errors
/// Returns [`LayerNormError::Kernel`] if the byte count is not
/// `expected * 4`.
pub fn cubecl_bytes_to_f32(bytes: &[u8], expected: usize) -> Result<Vec<f32>> {
    if bytes.len() != expected * F32_BYTES {
        return Err(LayerNormError::Kernel(format!(
            "device buffer holds {} bytes, expected {} for {expected} f32 values",
            bytes.len(),
            expected * F32_BYTES
        )));
    }
    Ok(bytes
        .chunks_exact(F32_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Bytes for an optional operand.
///
/// Kernels always bind every array argument; an absent operand is bound to
/// a one-element placeholder and masked off by a flag.
#[must_use]
pub fn optional_operand_bytes(values: Option<&[f32]>) -> (Vec<u8>, usize, u32) {
    match values {
        Some(values) => (f32_to_cubecl_bytes(values), values.len(), 1),
        None => (f32_to_cubecl_bytes(&[0.0]), 1, 0),
    }
}
