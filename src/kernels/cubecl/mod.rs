// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! `CubeCL` GPU kernels for the layer norm passes.
//!
//! ## Module Structure
//!
//! - [`interop`] - host buffer ↔ `CubeCL` byte conversion, runtime detection
//! - `kernel` - `#[cube(launch)]` kernels and launchers (`cuda` feature)
//!
//! The launchers take and return the same flat buffers as the host entry
//! points, so the tensor facade can swap one for the other.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use layernorm_rs::kernels::cubecl::layer_norm_forward_cuda;
//!
//! let out = layer_norm_forward_cuda(&x, Some(&gamma), Some(&beta), layout, 1e-5, &config)?;
//! ```

pub mod interop;
#[cfg(feature = "cuda")]
pub mod kernel;

pub use interop::{cubecl_bytes_to_f32, f32_to_cubecl_bytes, has_cubecl_cuda_support};
#[cfg(feature = "cuda")]
pub use kernel::{layer_norm_backward_cuda, layer_norm_forward_cuda};
