// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Column-wise reduction for the scale and shift gradients.
//!
//! ```text
//! dScale[c] = Σ_r dY[r, c] * (X[r, c] - mean[r]) * rstd[r]
//! dShift[c] = Σ_r dY[r, c]
//! ```
//!
//! Every column sums over all `M` rows, so consecutive contributions are `N`
//! elements apart. Two kernels share one signature:
//!
//! - [`param_grad_simple`]: one lane per column walking every row. Used
//!   below `tiled_threshold` rows.
//! - [`param_grad_tiled`]: one block per `tile_width` columns with a
//!   `tile_width × tile_width/2` lane grid. Each lane sums two interleaved
//!   row stripes, the partials land in a padded `tile_width × (tile_width+1)`
//!   scratch tile, and a transposed read lets one lane group reduce each
//!   column with a plain lane-group sum.
//!
//! An absent output skips its accumulation in both kernels.

use num_traits::Zero;
use rayon::prelude::*;

use super::backward::BackwardInputs;
use super::reduce::lane_group_reduce;
use super::{LayerNormConfig, RowLayout};
use crate::precision::{Accumulator, NormElement};

/// Parameter-gradient destinations; either may be absent.
#[derive(Debug)]
pub struct ParamGradSink<'a, T> {
    /// Gradient of the scale, length `N`
    pub dscale: Option<&'a mut [T]>,
    /// Gradient of the shift, length `N`
    pub dshift: Option<&'a mut [T]>,
}

impl<'a, T> ParamGradSink<'a, T> {
    /// True when at least one output was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.dscale.is_some() || self.dshift.is_some()
    }

    /// Split into disjoint column tiles of `width` columns.
    fn into_tiles(self, width: usize, cols: usize) -> Vec<ColumnTile<'a, T>> {
        let mut dscale = self.dscale.map(|s| s.chunks_mut(width));
        let mut dshift = self.dshift.map(|s| s.chunks_mut(width));
        (0..cols.div_ceil(width))
            .map(|tile| ColumnTile {
                first_col: tile * width,
                width: width.min(cols - tile * width),
                dscale: dscale.as_mut().and_then(Iterator::next),
                dshift: dshift.as_mut().and_then(Iterator::next),
            })
            .collect()
    }
}

/// Output columns owned by one block.
struct ColumnTile<'a, T> {
    first_col: usize,
    width: usize,
    dscale: Option<&'a mut [T]>,
    dshift: Option<&'a mut [T]>,
}

/// Signature shared by both reduction kernels.
pub type ParamGradKernel<T> =
    fn(&BackwardInputs<'_, T>, RowLayout, &LayerNormConfig, ParamGradSink<'_, T>);

/// Pick the kernel for `layout.rows`.
#[must_use]
pub fn select_param_grad_kernel<T: NormElement>(
    layout: RowLayout,
    config: &LayerNormConfig,
) -> ParamGradKernel<T> {
    if config.use_tiled_reduction(layout.rows) {
        param_grad_tiled::<T>
    } else {
        param_grad_simple::<T>
    }
}

/// Reduce the parameter gradients with the kernel chosen for `layout.rows`.
pub fn reduce_parameter_gradients<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    sink: ParamGradSink<'_, T>,
) {
    if !sink.is_requested() {
        return;
    }
    let tiled = config.use_tiled_reduction(layout.rows);
    tracing::debug!(
        rows = layout.rows,
        cols = layout.cols,
        tiled,
        dscale = sink.dscale.is_some(),
        dshift = sink.dshift.is_some(),
        "parameter gradient reduction"
    );
    let kernel = select_param_grad_kernel::<T>(layout, config);
    kernel(inputs, layout, config, sink);
}

/// One lane per column, serial over rows.
pub fn param_grad_simple<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    sink: ParamGradSink<'_, T>,
) {
    sink.into_tiles(config.block_size, layout.cols)
        .into_par_iter()
        .for_each(|tile| {
            let ColumnTile {
                first_col,
                width,
                mut dscale,
                mut dshift,
            } = tile;
            for lane in 0..width {
                let (g, b) = column_sums(
                    inputs,
                    layout,
                    first_col + lane,
                    dscale.is_some(),
                    dshift.is_some(),
                );
                if let Some(out) = dscale.as_deref_mut() {
                    out[lane] = T::from_acc(g);
                }
                if let Some(out) = dshift.as_deref_mut() {
                    out[lane] = T::from_acc(b);
                }
            }
        });
}

fn column_sums<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    col: usize,
    want_dscale: bool,
    want_dshift: bool,
) -> (T::Acc, T::Acc) {
    let mut g = <T::Acc as Zero>::zero();
    let mut b = <T::Acc as Zero>::zero();
    for row in 0..layout.rows {
        let index = row * layout.cols + col;
        let dy = inputs.dy[index].to_acc();
        if want_dscale {
            g += dy * (inputs.x[index].to_acc() - inputs.mean[row]) * inputs.rstd[row];
        }
        if want_dshift {
            b += dy;
        }
    }
    (g, b)
}

/// Padded scratch tiles plus the registers of one lane group.
struct TileScratch<A> {
    dscale: Vec<A>,
    dshift: Vec<A>,
    lanes: Vec<A>,
}

impl<A: Accumulator> TileScratch<A> {
    fn new(tile_width: usize) -> Self {
        let padded = tile_width * (tile_width + 1);
        Self {
            dscale: vec![A::zero(); padded],
            dshift: vec![A::zero(); padded],
            lanes: vec![A::zero(); tile_width],
        }
    }
}

/// Running sums of one lane: two row stripes per quantity.
#[derive(Clone, Copy)]
struct StripeSums<A> {
    dscale: [A; 2],
    dshift: [A; 2],
}

/// Transposed tile reduction, one block per `tile_width` columns.
pub fn param_grad_tiled<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    sink: ParamGradSink<'_, T>,
) {
    let tile_width = config.tile_width;
    tracing::trace!(
        tiles = config.num_tiles(layout.cols),
        tile_width,
        tile_rows = config.tile_rows(),
        "tiled parameter gradient launch"
    );
    sink.into_tiles(tile_width, layout.cols)
        .into_par_iter()
        .for_each_init(
            || TileScratch::new(tile_width),
            |scratch, tile| reduce_tile(inputs, layout, config, scratch, tile),
        );
}

fn reduce_tile<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    config: &LayerNormConfig,
    scratch: &mut TileScratch<T::Acc>,
    tile: ColumnTile<'_, T>,
) {
    let tile_width = config.tile_width;
    let tile_rows = config.tile_rows();
    let stride = tile_width + 1;
    let ColumnTile {
        first_col,
        mut dscale,
        mut dshift,
        ..
    } = tile;
    let want_dscale = dscale.is_some();
    let want_dshift = dshift.is_some();

    for ty in 0..tile_rows {
        for tx in 0..tile_width {
            let sums = stripe_sums(
                inputs,
                layout,
                first_col + tx,
                ty,
                tile_rows,
                want_dscale,
                want_dshift,
            );
            if want_dscale {
                scratch.dscale[ty * stride + tx] = sums.dscale[0];
                scratch.dscale[(ty + tile_rows) * stride + tx] = sums.dscale[1];
            }
            if want_dshift {
                scratch.dshift[ty * stride + tx] = sums.dshift[0];
                scratch.dshift[(ty + tile_rows) * stride + tx] = sums.dshift[1];
            }
        }
    }
    // barrier: the whole tile is written before any transposed read

    for ty in 0..tile_rows {
        for col_in_tile in [ty, ty + tile_rows] {
            if first_col + col_in_tile >= layout.cols {
                continue;
            }
            if let Some(out) = dscale.as_deref_mut() {
                let sum =
                    transpose_reduce(&scratch.dscale, &mut scratch.lanes, stride, col_in_tile);
                out[col_in_tile] = T::from_acc(sum);
            }
            if let Some(out) = dshift.as_deref_mut() {
                let sum =
                    transpose_reduce(&scratch.dshift, &mut scratch.lanes, stride, col_in_tile);
                out[col_in_tile] = T::from_acc(sum);
            }
        }
    }
}

/// Partial sums of lane `(tx, ty)`: rows `ty, ty + 2R, ...` go to stripe 0
/// and rows `ty + R, ty + 3R, ...` to stripe 1, with `R = tile_rows`.
fn stripe_sums<T: NormElement>(
    inputs: &BackwardInputs<'_, T>,
    layout: RowLayout,
    col: usize,
    ty: usize,
    tile_rows: usize,
    want_dscale: bool,
    want_dshift: bool,
) -> StripeSums<T::Acc> {
    let zero = <T::Acc as Zero>::zero();
    let mut sums = StripeSums {
        dscale: [zero; 2],
        dshift: [zero; 2],
    };
    if col >= layout.cols {
        return sums;
    }
    let mut row = ty;
    while row < layout.rows {
        for (stripe, r) in [row, row + tile_rows].into_iter().enumerate() {
            if r >= layout.rows {
                break;
            }
            let index = r * layout.cols + col;
            let dy = inputs.dy[index].to_acc();
            if want_dscale {
                sums.dscale[stripe] +=
                    dy * (inputs.x[index].to_acc() - inputs.mean[r]) * inputs.rstd[r];
            }
            if want_dshift {
                sums.dshift[stripe] += dy;
            }
        }
        row += 2 * tile_rows;
    }
    sums
}

/// Load column `col` of every stripe into one lane group and sum it.
fn transpose_reduce<A: Accumulator>(tile: &[A], lanes: &mut [A], stride: usize, col: usize) -> A {
    for (stripe, lane) in lanes.iter_mut().enumerate() {
        *lane = tile[stripe * stride + col];
    }
    lane_group_reduce(lanes, |a, b| a + b)
}
