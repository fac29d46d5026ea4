// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Launch geometry and tuning constants for the normalization passes.
//!
//! The defaults match a device with 32-wide lane groups: 256 lanes per row
//! block, and a 32-column tile with a `32 × 16` lane grid for the tiled
//! parameter-gradient reduction. Both the row threshold and the tile width
//! are tuning knobs tied to the device, not semantic constants.

use crate::error::{LayerNormError, Result};

/// Lanes per row block.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Lane-group (warp / plane) width.
pub const DEFAULT_LANE_GROUP_WIDTH: usize = 32;

/// Row count at which the tiled parameter-gradient path takes over.
pub const DEFAULT_TILED_THRESHOLD: usize = 512;

/// Column tile width of the tiled parameter-gradient path.
pub const DEFAULT_TILE_WIDTH: usize = 32;

/// Configuration shared by every pass of one forward or backward call.
///
/// # Example
///
/// ```rust
/// use layernorm_rs::kernels::LayerNormConfig;
///
/// let config = LayerNormConfig::default()
///     .with_block_size(128)
///     .with_tiled_threshold(1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerNormConfig {
    /// Lanes per block for the row-scoped passes.
    /// Must be a multiple of `lane_group_width`.
    pub block_size: usize,

    /// Lanes per lane group. Must be a power of two.
    pub lane_group_width: usize,

    /// Row count at or above which the tiled parameter-gradient path runs.
    pub tiled_threshold: usize,

    /// Columns per tile in the tiled path. Must be a power of two, at least 2,
    /// and no wider than `lane_group_width`.
    pub tile_width: usize,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            lane_group_width: DEFAULT_LANE_GROUP_WIDTH,
            tiled_threshold: DEFAULT_TILED_THRESHOLD,
            tile_width: DEFAULT_TILE_WIDTH,
        }
    }
}

impl LayerNormConfig {
    /// Narrow blocks for short rows (`N` in the low hundreds).
    #[must_use]
    pub fn for_small_rows() -> Self {
        Self {
            block_size: 128,
            ..Self::default()
        }
    }

    /// Wide blocks for datacenter parts with large register files.
    #[must_use]
    pub fn for_datacenter() -> Self {
        Self {
            block_size: 512,
            ..Self::default()
        }
    }

    /// Set lanes per row block.
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the lane-group width.
    #[must_use]
    pub const fn with_lane_group_width(mut self, width: usize) -> Self {
        self.lane_group_width = width;
        self
    }

    /// Set the row threshold of the tiled parameter-gradient path.
    #[must_use]
    pub const fn with_tiled_threshold(mut self, rows: usize) -> Self {
        self.tiled_threshold = rows;
        self
    }

    /// Set the column tile width.
    #[must_use]
    pub const fn with_tile_width(mut self, tile_width: usize) -> Self {
        self.tile_width = tile_width;
        self
    }

    /// Check lane geometry.
    ///
    /// # Errors
    /// Returns [`LayerNormError::InvalidConfig`] describing the first violated
    /// constraint.
    pub fn validate(&self) -> Result<()> {
        if !self.lane_group_width.is_power_of_two() {
            return Err(LayerNormError::InvalidConfig(format!(
                "lane_group_width must be a power of 2, got {}",
                self.lane_group_width
            )));
        }
        if self.block_size == 0 || self.block_size % self.lane_group_width != 0 {
            return Err(LayerNormError::InvalidConfig(format!(
                "block_size {} must be a non-zero multiple of lane_group_width {}",
                self.block_size, self.lane_group_width
            )));
        }
        if self.lane_groups_per_block() > self.lane_group_width {
            return Err(LayerNormError::InvalidConfig(format!(
                "block_size {} needs {} lane groups, more than one group of {} can combine",
                self.block_size,
                self.lane_groups_per_block(),
                self.lane_group_width
            )));
        }
        if self.tile_width < 2 || !self.tile_width.is_power_of_two() {
            return Err(LayerNormError::InvalidConfig(format!(
                "tile_width must be a power of 2 and at least 2, got {}",
                self.tile_width
            )));
        }
        if self.tile_width > self.lane_group_width {
            return Err(LayerNormError::InvalidConfig(format!(
                "tile_width {} exceeds lane_group_width {}",
                self.tile_width, self.lane_group_width
            )));
        }
        Ok(())
    }

    /// Number of lane groups in a full row block.
    #[must_use]
    pub const fn lane_groups_per_block(&self) -> usize {
        self.block_size / self.lane_group_width
    }

    /// Lanes actually launched for a row of `n` columns.
    ///
    /// Short rows get fewer lane groups; the result is always a whole number
    /// of lane groups and never exceeds `block_size`.
    #[must_use]
    pub fn lanes_for_row(&self, n: usize) -> usize {
        n.next_multiple_of(self.lane_group_width)
            .clamp(self.lane_group_width, self.block_size)
    }

    /// Row extent of the tiled lane grid (`tile_width / 2`).
    #[must_use]
    pub const fn tile_rows(&self) -> usize {
        self.tile_width / 2
    }

    /// Number of column tiles covering `n` columns.
    #[must_use]
    pub const fn num_tiles(&self, n: usize) -> usize {
        n.div_ceil(self.tile_width)
    }

    /// Whether a reduction over `m` rows takes the tiled path.
    #[must_use]
    pub const fn use_tiled_reduction(&self, m: usize) -> bool {
        m >= self.tiled_threshold
    }

    /// Shared scratch bytes per block.
    ///
    /// Layout:
    /// - Row passes: one slot per lane group, three slots wide for the
    ///   `(count, mean, m2)` triple.
    /// - Tiled pass: two padded `tile_width × (tile_width + 1)` tiles.
    #[must_use]
    pub const fn shared_memory_bytes(&self, bytes_per_acc: usize) -> usize {
        let row_scratch = 3 * self.lane_group_width;
        let tile_scratch = 2 * self.tile_width * (self.tile_width + 1);
        let slots = if row_scratch > tile_scratch {
            row_scratch
        } else {
            tile_scratch
        };
        slots * bytes_per_acc
    }
}
