//! Test utilities and fixtures for the layer norm integration tests.
//!
//! Seeded data generation, an `f64` two-pass reference for both passes,
//! and tolerance checks.

#![allow(dead_code)]

use anyhow::{ensure, Result};
use layernorm_rs::kernels::RowLayout;

/// Value distributions for generated inputs.
#[derive(Debug, Clone, Copy)]
pub enum ValueDistribution {
    /// Uniform in `[-max, max]`.
    Uniform { max: f64 },
    /// Normal with the given mean and standard deviation.
    Normal { mean: f64, std: f64 },
    /// Every value equal.
    Constant(f64),
}

/// One forward/backward problem.
#[derive(Debug, Clone)]
pub struct LayerNormCase {
    pub layout: RowLayout,
    pub x: Vec<f64>,
    pub scale: Vec<f64>,
    pub shift: Vec<f64>,
    pub dy: Vec<f64>,
}

impl LayerNormCase {
    /// Normal inputs and upstream gradient, parameters around 1 and 0.
    pub fn new(rows: usize, cols: usize, seed: u64) -> Self {
        let x = ValueDistribution::Normal {
            mean: 0.5,
            std: 2.0,
        };
        Self::with_distribution(rows, cols, x, seed)
    }

    /// Inputs drawn from `distribution`.
    pub fn with_distribution(
        rows: usize,
        cols: usize,
        distribution: ValueDistribution,
        seed: u64,
    ) -> Self {
        let layout = RowLayout::new(rows, cols);
        let numel = layout.numel();
        let scale = ValueDistribution::Normal {
            mean: 1.0,
            std: 0.25,
        };
        let grad = ValueDistribution::Normal {
            mean: 0.0,
            std: 1.0,
        };
        Self {
            layout,
            x: TestFixtures::generate(numel, distribution, seed),
            scale: TestFixtures::generate(cols, scale, seed + 1),
            shift: TestFixtures::generate(cols, ValueDistribution::Uniform { max: 0.5 }, seed + 2),
            dy: TestFixtures::generate(numel, grad, seed + 3),
        }
    }
}

/// Seeded generators.
pub struct TestFixtures;

impl TestFixtures {
    /// `count` values from `distribution`, reproducible per `seed`.
    pub fn generate(count: usize, distribution: ValueDistribution, seed: u64) -> Vec<f64> {
        match distribution {
            ValueDistribution::Uniform { max } => Self::uniform(count, seed)
                .into_iter()
                .map(|u| (u * 2.0 - 1.0) * max)
                .collect(),
            ValueDistribution::Normal { mean, std } => Self::normal(count, seed)
                .into_iter()
                .map(|z| mean + z * std)
                .collect(),
            ValueDistribution::Constant(value) => vec![value; count],
        }
    }

    /// Uniform `[0, 1)` from hashing `seed + i`.
    fn uniform(count: usize, seed: u64) -> Vec<f64> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        (0..count)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(i as u64).hash(&mut hasher);
                (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
            })
            .collect()
    }

    /// Standard normal via Box-Muller.
    fn normal(count: usize, seed: u64) -> Vec<f64> {
        let uniform = Self::uniform(count * 2, seed);
        uniform
            .chunks_exact(2)
            .map(|pair| {
                let u1 = pair[0].max(1e-12);
                let u2 = pair[1];
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            })
            .collect()
    }
}

/// Two-pass `f64` forward: `(y, mean, rstd)`.
pub fn reference_forward(
    x: &[f64],
    scale: Option<&[f64]>,
    shift: Option<&[f64]>,
    layout: RowLayout,
    eps: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = layout.cols;
    let mut y = vec![0.0; layout.numel()];
    let mut means = Vec::with_capacity(layout.rows);
    let mut rstds = Vec::with_capacity(layout.rows);
    for (row, (x_row, y_row)) in x.chunks(n).zip(y.chunks_mut(n)).enumerate() {
        let mean = x_row.iter().sum::<f64>() / n as f64;
        let var = x_row.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        let rstd = 1.0 / (var + eps).sqrt();
        for (c, (out, &v)) in y_row.iter_mut().zip(x_row).enumerate() {
            let gamma = scale.map_or(1.0, |s| s[c]);
            let beta = shift.map_or(0.0, |s| s[c]);
            *out = (v - mean) * rstd * gamma + beta;
        }
        debug_assert_eq!(means.len(), row);
        means.push(mean);
        rstds.push(rstd);
    }
    (y, means, rstds)
}

/// Textbook `f64` backward: `(dx, dscale, dshift)`.
///
/// `dx = rstd · (g - mean(g) - x̂ · mean(g · x̂))` with `g = dy · scale`.
pub fn reference_backward(
    dy: &[f64],
    x: &[f64],
    scale: Option<&[f64]>,
    layout: RowLayout,
    eps: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = layout.cols;
    let (_, means, rstds) = reference_forward(x, None, None, layout, eps);
    let mut dx = vec![0.0; layout.numel()];
    let mut dscale = vec![0.0; n];
    let mut dshift = vec![0.0; n];
    for row in 0..layout.rows {
        let base = row * n;
        let xhat: Vec<f64> = (0..n).map(|c| (x[base + c] - means[row]) * rstds[row]).collect();
        let g: Vec<f64> = (0..n).map(|c| dy[base + c] * scale.map_or(1.0, |s| s[c])).collect();
        let g_mean = g.iter().sum::<f64>() / n as f64;
        let gx_mean = g.iter().zip(&xhat).map(|(a, b)| a * b).sum::<f64>() / n as f64;
        for c in 0..n {
            dx[base + c] = rstds[row] * (g[c] - g_mean - xhat[c] * gx_mean);
            dscale[c] += dy[base + c] * xhat[c];
            dshift[c] += dy[base + c];
        }
    }
    (dx, dscale, dshift)
}

/// Numerical comparison helpers.
pub struct ValidationUtils;

impl ValidationUtils {
    /// Largest elementwise absolute difference.
    pub fn max_abs_diff(actual: &[f64], expected: &[f64]) -> f64 {
        actual
            .iter()
            .zip(expected)
            .map(|(a, e)| (a - e).abs())
            .fold(0.0, f64::max)
    }

    /// Check `|a - e| <= atol + rtol · |e|` everywhere.
    pub fn assert_close(
        label: &str,
        actual: &[f64],
        expected: &[f64],
        atol: f64,
        rtol: f64,
    ) -> Result<()> {
        ensure!(
            actual.len() == expected.len(),
            "{label}: length {} vs {}",
            actual.len(),
            expected.len()
        );
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            ensure!(
                (a - e).abs() <= atol + rtol * e.abs(),
                "{label}[{i}]: got {a}, expected {e}"
            );
        }
        Ok(())
    }

    /// Widen a narrow buffer for comparison.
    pub fn widen<T: Copy + Into<f64>>(values: &[T]) -> Vec<f64> {
        values.iter().map(|&v| v.into()).collect()
    }

    /// Narrow to `f32`.
    pub fn to_f32(values: &[f64]) -> Vec<f32> {
        values.iter().map(|&v| v as f32).collect()
    }
}
