// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Layer normalization kernels.
//!
//! - [`reduce`] - lane-group and block reductions, Welford merge
//! - [`moments`] - per-row mean and reciprocal standard deviation
//! - [`forward`] - forward entry points and the affine-normalize map
//! - [`backward`] - input gradient and backward entry points
//! - [`param_grad`] - column reductions for the scale/shift gradients
//! - [`layer_norm`] - [`LayerNorm`] over Candle tensors
//! - [`cubecl`] - GPU kernels (`cuda` feature)

pub mod backward;
pub mod config;
pub mod cubecl;
pub mod forward;
pub mod layer_norm;
pub mod layout;
pub mod moments;
pub mod param_grad;
pub mod reduce;

pub use backward::{
    layer_norm_backward, layer_norm_backward_into, BackwardInputs, BackwardOutput,
    GradientBuffers, GradientMask,
};
pub use config::LayerNormConfig;
pub use forward::{layer_norm_forward, layer_norm_forward_into, ForwardBuffers, ForwardOutput};
pub use layer_norm::{layer_norm, LayerNorm, LayerNormGrads, LayerNormStats};
pub use layout::RowLayout;
pub use param_grad::ParamGradSink;
pub use reduce::WelfordState;
