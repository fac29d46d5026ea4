// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Forward pass: statistics, then the affine-normalize map.
//!
//! ```text
//! (mean, rstd) = moments(X)
//! Y[r, c] = (X[r, c] - mean[r]) * rstd[r] * scale[c] + shift[c]
//! ```
//!
//! Absent `scale`/`shift` behave as all-ones/all-zeros without a buffer.

use num_traits::{One, Zero};
use rayon::prelude::*;

use super::moments::compute_moments;
use super::{LayerNormConfig, RowLayout};
use crate::error::Result;
use crate::precision::{Accumulator, NormElement};

/// Owned result of [`layer_norm_forward`].
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput<T: NormElement> {
    /// Normalized output, `M × N`
    pub y: Vec<T>,
    /// Per-row mean, in accumulator precision
    pub mean: Vec<T::Acc>,
    /// Per-row reciprocal standard deviation, in accumulator precision
    pub rstd: Vec<T::Acc>,
}

/// Caller-owned destinations for [`layer_norm_forward_into`].
#[derive(Debug)]
pub struct ForwardBuffers<'a, T: NormElement> {
    /// Normalized output, `M × N`
    pub y: &'a mut [T],
    /// Per-row mean, length `M`
    pub mean: &'a mut [T::Acc],
    /// Per-row reciprocal standard deviation, length `M`
    pub rstd: &'a mut [T::Acc],
}

/// Normalize every row of `x` and apply the optional affine transform.
///
/// # Arguments
/// * `x` - Input, `M × N` row-major
/// * `scale` - Optional per-column scale (gamma), length `N`
/// * `shift` - Optional per-column shift (beta), length `N`
/// * `layout` - `(M, N)`
/// * `eps` - Added to the variance before the square root
/// * `config` - Launch geometry
///
/// # Errors
/// Returns an error if any buffer length disagrees with `layout`, if
/// `N == 0` while `M > 0`, or if `config` is invalid.
pub fn layer_norm_forward<T: NormElement>(
    x: &[T],
    scale: Option<&[T]>,
    shift: Option<&[T]>,
    layout: RowLayout,
    eps: f64,
    config: &LayerNormConfig,
) -> Result<ForwardOutput<T>> {
    let mut out = ForwardOutput {
        y: vec![T::zero(); x.len()],
        mean: vec![<T::Acc as Zero>::zero(); layout.rows],
        rstd: vec![<T::Acc as Zero>::zero(); layout.rows],
    };
    layer_norm_forward_into(
        x,
        scale,
        shift,
        layout,
        eps,
        config,
        ForwardBuffers {
            y: &mut out.y,
            mean: &mut out.mean,
            rstd: &mut out.rstd,
        },
    )?;
    Ok(out)
}

/// [`layer_norm_forward`] writing into caller-owned buffers.
///
/// With `M == 0` the call validates its arguments and returns without
/// touching `out`.
///
/// # Errors
/// Same as [`layer_norm_forward`], plus length checks on `out`.
pub fn layer_norm_forward_into<T: NormElement>(
    x: &[T],
    scale: Option<&[T]>,
    shift: Option<&[T]>,
    layout: RowLayout,
    eps: f64,
    config: &LayerNormConfig,
    out: ForwardBuffers<'_, T>,
) -> Result<()> {
    config.validate()?;
    layout.check_cols()?;
    layout.check_matrix("x", x.len())?;
    layout.check_optional_per_col("scale", scale.map(<[T]>::len))?;
    layout.check_optional_per_col("shift", shift.map(<[T]>::len))?;
    layout.check_matrix("y", out.y.len())?;
    layout.check_per_row("mean", out.mean.len())?;
    layout.check_per_row("rstd", out.rstd.len())?;

    if layout.is_empty() {
        tracing::debug!(cols = layout.cols, "layer norm forward: zero rows, nothing to do");
        return Ok(());
    }
    tracing::debug!(
        rows = layout.rows,
        cols = layout.cols,
        has_scale = scale.is_some(),
        has_shift = shift.is_some(),
        "layer norm forward"
    );

    let eps = <T::Acc as Accumulator>::from_eps(eps);
    compute_moments(x, layout, eps, config, out.mean, out.rstd);
    // statistics are complete for every row before any row is normalized
    apply_affine(x, layout, out.mean, out.rstd, scale, shift, out.y);
    Ok(())
}

/// Elementwise `(x - mean) * rstd * scale + shift`, one block per row.
pub fn apply_affine<T: NormElement>(
    x: &[T],
    layout: RowLayout,
    mean: &[T::Acc],
    rstd: &[T::Acc],
    scale: Option<&[T]>,
    shift: Option<&[T]>,
    y: &mut [T],
) {
    let n = layout.cols;
    y.par_chunks_exact_mut(n)
        .zip(x.par_chunks_exact(n))
        .zip(mean.par_iter())
        .zip(rstd.par_iter())
        .for_each(|(((y_row, x_row), &mean), &rstd)| {
            normalize_row(x_row, mean, rstd, scale, shift, y_row);
        });
}

fn normalize_row<T: NormElement>(
    x_row: &[T],
    mean: T::Acc,
    rstd: T::Acc,
    scale: Option<&[T]>,
    shift: Option<&[T]>,
    y_row: &mut [T],
) {
    for (col, (y, &x)) in y_row.iter_mut().zip(x_row).enumerate() {
        let gamma = scale.map_or_else(<T::Acc as One>::one, |s| s[col].to_acc());
        let beta = shift.map_or_else(<T::Acc as Zero>::zero, |s| s[col].to_acc());
        *y = T::from_acc((x.to_acc() - mean) * rstd * gamma + beta);
    }
}
