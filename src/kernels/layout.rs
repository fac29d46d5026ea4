// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Dense row-major `(M, N)` view shared by every pass.

use crate::error::{LayerNormError, Result};

/// Logical shape of a contiguous row-major batch.
///
/// `rows` independent instances of `cols` features each; row stride is
/// `cols`, column stride is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLayout {
    /// Number of rows (`M`)
    pub rows: usize,
    /// Number of columns (`N`)
    pub cols: usize,
}

impl RowLayout {
    /// Create a layout of `rows × cols`.
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Total element count.
    #[must_use]
    pub const fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// True when the batch has no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Reject a non-empty batch with zero-width rows.
    ///
    /// # Errors
    /// Returns [`LayerNormError::InvalidConfig`] when `rows > 0` and `cols == 0`.
    pub fn check_cols(&self) -> Result<()> {
        if self.rows > 0 && self.cols == 0 {
            return Err(LayerNormError::InvalidConfig(format!(
                "cannot normalize {} rows of width 0",
                self.rows
            )));
        }
        Ok(())
    }

    /// Check a full `M × N` buffer.
    ///
    /// # Errors
    /// Returns [`LayerNormError::BufferLength`] on mismatch.
    pub fn check_matrix(&self, buffer: &'static str, len: usize) -> Result<()> {
        check_len(buffer, self.numel(), len)
    }

    /// Check a per-row buffer of length `M`.
    ///
    /// # Errors
    /// Returns [`LayerNormError::BufferLength`] on mismatch.
    pub fn check_per_row(&self, buffer: &'static str, len: usize) -> Result<()> {
        check_len(buffer, self.rows, len)
    }

    /// Check a per-column buffer of length `N`.
    ///
    /// # Errors
    /// Returns [`LayerNormError::BufferLength`] on mismatch.
    pub fn check_per_col(&self, buffer: &'static str, len: usize) -> Result<()> {
        check_len(buffer, self.cols, len)
    }

    /// Same as [`check_per_col`](Self::check_per_col) for optional buffers.
    ///
    /// # Errors
    /// Returns [`LayerNormError::BufferLength`] when present with the wrong length.
    pub fn check_optional_per_col(&self, buffer: &'static str, len: Option<usize>) -> Result<()> {
        len.map_or(Ok(()), |len| self.check_per_col(buffer, len))
    }
}

fn check_len(buffer: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayerNormError::BufferLength {
            buffer,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_checks() {
        let layout = RowLayout::new(4, 8);
        assert_eq!(layout.numel(), 32);
        assert!(layout.check_matrix("x", 32).is_ok());
        assert!(layout.check_per_row("mean", 4).is_ok());
        assert!(layout.check_optional_per_col("scale", None).is_ok());

        let err = layout.check_per_col("scale", 7).unwrap_err();
        assert!(matches!(
            err,
            LayerNormError::BufferLength {
                buffer: "scale",
                expected: 8,
                actual: 7
            }
        ));
    }

    #[test]
    fn test_zero_width_rows_rejected() {
        assert!(RowLayout::new(3, 0).check_cols().is_err());
        assert!(RowLayout::new(0, 0).check_cols().is_ok());
        assert!(RowLayout::new(0, 5).is_empty());
    }
}
