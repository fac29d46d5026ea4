// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Backward pass.
//!
//! The input gradient runs as three row-parallel passes:
//!
//! ```text
//! 1. stats:        ds[r] = Σ_c dY·X·scale      db[r] = Σ_c dY·scale
//! 2. coefficients: s  = 1/N
//!                  a  = (db·mean - ds) · rstd³ · s
//!                  c1 = a
//!                  c2 = -(a·mean + db·rstd·s)
//! 3. apply:        dX[r, c] = rstd·dY·scale + c1·X + c2
//! ```
//!
//! The closed form for `c1`/`c2` folds the mean and variance terms of the
//! chain rule into one fused multiply-add per element, so `dX` needs no
//! second reduction. The parameter gradients only read the inputs and run
//! concurrently with the three passes above (see [`super::param_grad`]).

use num_traits::{One, Zero};
use rayon::prelude::*;

use super::param_grad::{reduce_parameter_gradients, ParamGradSink};
use super::reduce::{block_reduce_sum, BlockScratch};
use super::{LayerNormConfig, RowLayout};
use crate::error::Result;
use crate::precision::{Accumulator, NormElement};

/// Read-only inputs of the backward pass.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a, T: NormElement> {
    /// Upstream gradient, `M × N`
    pub dy: &'a [T],
    /// Forward input, `M × N`
    pub x: &'a [T],
    /// Per-row mean from the forward pass
    pub mean: &'a [T::Acc],
    /// Per-row reciprocal standard deviation from the forward pass
    pub rstd: &'a [T::Acc],
    /// Optional per-column scale (gamma)
    pub scale: Option<&'a [T]>,
}

/// Which gradients to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GradientMask {
    /// Gradient w.r.t. the input
    pub dx: bool,
    /// Gradient w.r.t. the scale
    pub dscale: bool,
    /// Gradient w.r.t. the shift
    pub dshift: bool,
}

impl Default for GradientMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl GradientMask {
    /// Every gradient.
    pub const ALL: Self = Self {
        dx: true,
        dscale: true,
        dshift: true,
    };

    /// Input gradient only.
    pub const INPUT: Self = Self {
        dx: true,
        dscale: false,
        dshift: false,
    };

    /// Parameter gradients only.
    pub const PARAMS: Self = Self {
        dx: false,
        dscale: true,
        dshift: true,
    };

    /// True when nothing is requested.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.dx || self.dscale || self.dshift)
    }
}

/// Owned result of [`layer_norm_backward`]; `None` where not requested.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutput<T> {
    /// Gradient w.r.t. the input, `M × N`
    pub dx: Option<Vec<T>>,
    /// Gradient w.r.t. the scale, length `N`
    pub dscale: Option<Vec<T>>,
    /// Gradient w.r.t. the shift, length `N`
    pub dshift: Option<Vec<T>>,
}

/// Caller-owned gradient destinations; `None` skips that computation.
#[derive(Debug, Default)]
pub struct GradientBuffers<'a, T> {
    /// Gradient w.r.t. the input, `M × N`
    pub dx: Option<&'a mut [T]>,
    /// Gradient w.r.t. the scale, length `N`
    pub dscale: Option<&'a mut [T]>,
    /// Gradient w.r.t. the shift, length `N`
    pub dshift: Option<&'a mut [T]>,
}

/// Compute the requested gradients.
///
/// With `M == 0` a requested `dscale`/`dshift` is the empty sum (zeros of
/// length `N`) and a requested `dx` is empty.
///
/// # Errors
/// Returns an error if any buffer length disagrees with `layout`, if
/// `N == 0` while `M > 0`, or if `config` is invalid.
pub fn layer_norm_backward<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    mask: GradientMask,
    config: &LayerNormConfig,
) -> Result<BackwardOutput<T>> {
    let mut out = BackwardOutput {
        dx: mask.dx.then(|| vec![T::zero(); layout.numel()]),
        dscale: mask.dscale.then(|| vec![T::zero(); layout.cols]),
        dshift: mask.dshift.then(|| vec![T::zero(); layout.cols]),
    };
    layer_norm_backward_into(
        inputs,
        layout,
        config,
        GradientBuffers {
            dx: out.dx.as_deref_mut(),
            dscale: out.dscale.as_deref_mut(),
            dshift: out.dshift.as_deref_mut(),
        },
    )?;
    Ok(out)
}

/// [`layer_norm_backward`] writing into caller-owned buffers.
///
/// With `M == 0` the call validates its arguments and returns without
/// touching `out`.
///
/// # Errors
/// Same as [`layer_norm_backward`], plus length checks on `out`.
pub fn layer_norm_backward_into<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    out: GradientBuffers<'_, T>,
) -> Result<()> {
    config.validate()?;
    layout.check_cols()?;
    layout.check_matrix("dy", inputs.dy.len())?;
    layout.check_matrix("x", inputs.x.len())?;
    layout.check_per_row("mean", inputs.mean.len())?;
    layout.check_per_row("rstd", inputs.rstd.len())?;
    layout.check_optional_per_col("scale", inputs.scale.map(<[T]>::len))?;
    if let Some(dx) = out.dx.as_deref() {
        layout.check_matrix("dx", dx.len())?;
    }
    layout.check_optional_per_col("dscale", out.dscale.as_deref().map(<[T]>::len))?;
    layout.check_optional_per_col("dshift", out.dshift.as_deref().map(<[T]>::len))?;

    if layout.is_empty() {
        tracing::debug!(cols = layout.cols, "layer norm backward: zero rows, nothing to do");
        return Ok(());
    }
    tracing::debug!(
        rows = layout.rows,
        cols = layout.cols,
        dx = out.dx.is_some(),
        dscale = out.dscale.is_some(),
        dshift = out.dshift.is_some(),
        "layer norm backward"
    );

    let GradientBuffers { dx, dscale, dshift } = out;
    // the input-gradient chain and the column reduction share only read-only inputs
    rayon::join(
        || {
            if let Some(dx) = dx {
                input_gradient(inputs, layout, config, dx);
            }
        },
        || reduce_parameter_gradients(inputs, layout, config, ParamGradSink { dscale, dshift }),
    );
    Ok(())
}

/// Run stats → coefficients → apply for `dx`.
fn input_gradient<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    dx: &mut [T],
) {
    let zero = <T::Acc as Zero>::zero();
    let mut ds = vec![zero; layout.rows];
    let mut db = vec![zero; layout.rows];
    collect_backward_stats(inputs, layout, config, &mut ds, &mut db);

    let mut c1 = vec![zero; layout.rows];
    let mut c2 = vec![zero; layout.rows];
    derive_coefficients(inputs.mean, inputs.rstd, &ds, &db, layout.cols, &mut c1, &mut c2);

    apply_input_gradient(inputs, layout, &c1, &c2, dx);
}

/// Per-row `ds = Σ dY·X·scale` and `db = Σ dY·scale`, one block per row.
pub fn collect_backward_stats<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    ds: &mut [T::Acc],
    db: &mut [T::Acc],
) {
    let n = layout.cols;
    let lanes = config.lanes_for_row(n);
    let zero = <T::Acc as Zero>::zero();
    tracing::trace!(rows = layout.rows, cols = n, lanes, "backward row stats");

    ds.par_iter_mut()
        .zip(db.par_iter_mut())
        .zip(inputs.dy.par_chunks_exact(n))
        .zip(inputs.x.par_chunks_exact(n))
        .for_each_init(
            || (BlockScratch::new(config, zero), BlockScratch::new(config, zero)),
            |(ds_block, db_block), (((ds, db), dy_row), x_row)| {
                let group_width = ds_block.group_width();
                let (ds_lanes, ds_shared) = ds_block.begin(lanes, zero);
                let (db_lanes, db_shared) = db_block.begin(lanes, zero);
                for lane in 0..lanes {
                    for col in (lane..n).step_by(lanes) {
                        let gamma = inputs
                            .scale
                            .map_or_else(<T::Acc as One>::one, |s| s[col].to_acc());
                        let g = dy_row[col].to_acc() * gamma;
                        ds_lanes[lane] += g * x_row[col].to_acc();
                        db_lanes[lane] += g;
                    }
                }
                *ds = block_reduce_sum(ds_lanes, ds_shared, group_width);
                *db = block_reduce_sum(db_lanes, db_shared, group_width);
            },
        );
}

/// Closed-form `(c1, c2)` for one row.
#[must_use]
pub fn fused_coefficients<A: Accumulator>(mean: A, rstd: A, ds: A, db: A, n: usize) -> (A, A) {
    let s = A::from_count(n).recip();
    let a = (db * mean - ds) * rstd * rstd * rstd * s;
    (a, -(a * mean + db * rstd * s))
}

/// One lane per row: fill `c1`/`c2` from the row statistics.
pub fn derive_coefficients<A: Accumulator>(
    mean: &[A],
    rstd: &[A],
    ds: &[A],
    db: &[A],
    n: usize,
    c1: &mut [A],
    c2: &mut [A],
) {
    c1.par_iter_mut()
        .zip(c2.par_iter_mut())
        .enumerate()
        .for_each(|(row, (c1, c2))| {
            (*c1, *c2) = fused_coefficients(mean[row], rstd[row], ds[row], db[row], n);
        });
}

/// `dX = rstd·dY·scale + c1·X + c2`, one block per row.
pub fn apply_input_gradient<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    c1: &[T::Acc],
    c2: &[T::Acc],
    dx: &mut [T],
) {
    let n = layout.cols;
    dx.par_chunks_exact_mut(n)
        .zip(inputs.dy.par_chunks_exact(n))
        .zip(inputs.x.par_chunks_exact(n))
        .enumerate()
        .for_each(|(row, ((dx_row, dy_row), x_row))| {
            let (rstd, c1, c2) = (inputs.rstd[row], c1[row], c2[row]);
            for (col, dx) in dx_row.iter_mut().enumerate() {
                let gamma = inputs
                    .scale
                    .map_or_else(<T::Acc as One>::one, |s| s[col].to_acc());
                let value = rstd * dy_row[col].to_acc() * gamma + c1 * x_row[col].to_acc() + c2;
                *dx = T::from_acc(value);
            }
        });
}
