// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Per-row mean and reciprocal standard deviation.
//!
//! One block per row. Lane `l` folds columns `l, l + B, l + 2B, ...` into its
//! own Welford triple, the block merges the triples, and lane 0 writes:
//!
//! ```text
//! mean[row] = merged.mean
//! rstd[row] = 1 / sqrt(max(merged.m2 / N, 0) + eps)
//! ```

use rayon::prelude::*;

use super::reduce::{block_reduce_welford, BlockScratch, WelfordState};
use super::{LayerNormConfig, RowLayout};
use crate::precision::{Accumulator, NormElement};

/// Merge one row into a single Welford triple using `lanes` lanes.
pub fn row_moments<T: NormElement>(
    row: &[T],
    lanes: usize,
    scratch: &mut BlockScratch<WelfordState<T::Acc>>,
) -> WelfordState<T::Acc> {
    let group_width = scratch.group_width();
    let (lane_states, shared) = scratch.begin(lanes, WelfordState::empty());
    for (lane, state) in lane_states.iter_mut().enumerate() {
        *state = row
            .iter()
            .skip(lane)
            .step_by(lanes)
            .fold(*state, |acc, &x| acc.push(x.to_acc()));
    }
    block_reduce_welford(lane_states, shared, group_width)
}

/// `1 / sqrt(max(m2 / n, 0) + eps)`.
#[must_use]
pub fn rstd_from_moments<A: Accumulator>(state: &WelfordState<A>, n: A, eps: A) -> A {
    (state.variance(n) + eps).sqrt().recip()
}

/// Fill `mean` and `rstd` for every row of `x`.
///
/// Inputs are assumed validated against `layout` with `rows > 0`.
pub fn compute_moments<T: NormElement>(
    x: &[T],
    layout: RowLayout,
    eps: T::Acc,
    config: &LayerNormConfig,
    mean: &mut [T::Acc],
    rstd: &mut [T::Acc],
) {
    let n = layout.cols;
    let lanes = config.lanes_for_row(n);
    let width = <T::Acc as Accumulator>::from_count(n);
    tracing::trace!(rows = layout.rows, cols = n, lanes, "row moments");

    x.par_chunks_exact(n)
        .zip(mean.par_iter_mut())
        .zip(rstd.par_iter_mut())
        .for_each_init(
            || BlockScratch::new(config, WelfordState::empty()),
            |scratch, ((row, mean), rstd)| {
                let state = row_moments(row, lanes, scratch);
                *mean = state.mean;
                *rstd = rstd_from_moments(&state, width, eps);
            },
        );
}
