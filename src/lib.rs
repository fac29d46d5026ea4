// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # layernorm-rs
//!
//! Layer normalization forward and backward passes for batches of
//! independent rows, built on [Candle](https://github.com/huggingface/candle):
//!
//! - Per-row mean and reciprocal standard deviation via Welford's algorithm
//! - Affine normalize with optional scale (gamma) and shift (beta)
//! - Input gradient through closed-form fused coefficients
//! - Scale/shift gradients through a simple or a tiled column reduction
//! - `f16`/`bf16` storage with `f32` accumulation
//! - Workspace estimation utilities
//!
//! ## Status
//!
//! Every pass runs on the host through `rayon`, one block per row or column
//! tile. With the `cuda` feature, `f32` tensors on a CUDA device run the
//! same passes as `CubeCL` kernels.
//!
//! ## Quick Start
//!
//! ```rust
//! use layernorm_rs::kernels::{layer_norm_forward, LayerNormConfig, RowLayout};
//!
//! let x = vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0];
//! let config = LayerNormConfig::default();
//! let out = layer_norm_forward(&x, None, None, RowLayout::new(2, 4), 1e-5, &config)?;
//! assert!(out.y[4..].iter().all(|&v| v == 0.0));
//! # Ok::<(), layernorm_rs::LayerNormError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;
pub mod memory;
pub mod precision;

pub use error::{LayerNormError, Result};
