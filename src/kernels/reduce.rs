// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Lane-level and block-level reduction primitives.
//!
//! A block is a set of lanes split into lane groups of a power-of-two width.
//! Reduction runs in two stages:
//!
//! ```text
//! stage 1: each lane group halves its active width until lane 0 holds the
//!          group's value (the shuffle-down step)
//! barrier: lane 0 of group g has written scratch[g]
//! stage 2: group 0 loads scratch[lane] (identity past the last group) and
//!          halves again; lane 0 holds the block value
//! ```
//!
//! Lanes with no work keep the identity element, so blocks whose column
//! count does not divide evenly need no special casing.

use super::LayerNormConfig;
use crate::precision::Accumulator;

/// Running `(count, mean, m2)` triple of Welford's online algorithm.
///
/// `m2` is the sum of squared deviations from the running mean. The empty
/// state (`count == 0`) is the identity of [`welford_combine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelfordState<A> {
    /// Samples folded so far
    pub count: A,
    /// Running mean
    pub mean: A,
    /// Sum of squared deviations
    pub m2: A,
}

impl<A: Accumulator> WelfordState<A> {
    /// The absent-sample identity.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            count: A::zero(),
            mean: A::zero(),
            m2: A::zero(),
        }
    }

    /// Fold one sample.
    #[must_use]
    pub fn push(self, x: A) -> Self {
        let count = self.count + A::one();
        let delta = x - self.mean;
        let mean = self.mean + delta / count;
        let m2 = self.m2 + delta * (x - mean);
        Self { count, mean, m2 }
    }

    /// Population variance `m2 / n` of `n` samples, clamped at zero.
    #[must_use]
    pub fn variance(&self, n: A) -> A {
        (self.m2 / n).max(A::zero())
    }
}

/// Merge two partial triples.
///
/// `count = ca + cb`, the mean is the count-weighted mean, and
/// `m2 = m2a + m2b + delta² · ca · cb / count`.
#[must_use]
pub fn welford_combine<A: Accumulator>(a: WelfordState<A>, b: WelfordState<A>) -> WelfordState<A> {
    if a.count == A::zero() {
        return b;
    }
    if b.count == A::zero() {
        return a;
    }
    let count = a.count + b.count;
    let delta = b.mean - a.mean;
    let b_share = b.count / count;
    WelfordState {
        count,
        mean: a.mean + delta * b_share,
        m2: a.m2 + b.m2 + delta * delta * a.count * b_share,
    }
}

/// Reduce one lane group in place; lane 0 ends up with the result.
///
/// `lanes.len()` is the group width and must be a power of two.
pub fn lane_group_reduce<V, F>(lanes: &mut [V], combine: F) -> V
where
    V: Copy,
    F: Fn(V, V) -> V,
{
    debug_assert!(lanes.len().is_power_of_two());
    let mut offset = lanes.len() / 2;
    while offset > 0 {
        for lane in 0..offset {
            lanes[lane] = combine(lanes[lane], lanes[lane + offset]);
        }
        offset /= 2;
    }
    lanes[0]
}

/// Reduce a whole block of lanes through the shared scratch buffer.
///
/// `lanes.len()` is a multiple of `group_width`; `scratch` holds one slot per
/// lane of the leading group (`group_width` slots).
pub fn block_reduce<V, F>(
    lanes: &mut [V],
    scratch: &mut [V],
    group_width: usize,
    identity: V,
    combine: F,
) -> V
where
    V: Copy,
    F: Fn(V, V) -> V,
{
    debug_assert_eq!(lanes.len() % group_width, 0);
    debug_assert_eq!(scratch.len(), group_width);
    let groups = lanes.len() / group_width;

    for (group, lane_values) in lanes.chunks_exact_mut(group_width).enumerate() {
        scratch[group] = lane_group_reduce(lane_values, &combine);
    }
    // barrier: every group leader has published its slot

    scratch[groups..].fill(identity);
    lane_group_reduce(scratch, &combine)
}

/// Block-wide sum.
pub fn block_reduce_sum<A: Accumulator>(
    lanes: &mut [A],
    scratch: &mut [A],
    group_width: usize,
) -> A {
    block_reduce(lanes, scratch, group_width, A::zero(), |a, b| a + b)
}

/// Block-wide Welford merge.
pub fn block_reduce_welford<A: Accumulator>(
    lanes: &mut [WelfordState<A>],
    scratch: &mut [WelfordState<A>],
    group_width: usize,
) -> WelfordState<A> {
    block_reduce(lanes, scratch, group_width, WelfordState::empty(), welford_combine::<A>)
}

/// Per-worker lane registers and scratch for one block.
///
/// Allocated once per worker thread and reused across the blocks it runs.
#[derive(Debug, Clone)]
pub struct BlockScratch<V> {
    lanes: Vec<V>,
    shared: Vec<V>,
    group_width: usize,
}

impl<V: Copy> BlockScratch<V> {
    /// Allocate for the widest block `config` can launch.
    #[must_use]
    pub fn new(config: &LayerNormConfig, identity: V) -> Self {
        Self {
            lanes: vec![identity; config.block_size],
            shared: vec![identity; config.lane_group_width],
            group_width: config.lane_group_width,
        }
    }

    /// Reset the first `active` lanes to `identity` and hand them out along
    /// with the scratch slots.
    pub fn begin(&mut self, active: usize, identity: V) -> (&mut [V], &mut [V]) {
        let lanes = &mut self.lanes[..active];
        lanes.fill(identity);
        (lanes, &mut self.shared)
    }

    /// Lane-group width the scratch was sized for.
    #[must_use]
    pub const fn group_width(&self) -> usize {
        self.group_width
    }
}
