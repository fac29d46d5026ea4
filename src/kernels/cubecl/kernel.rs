// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Layer norm `CubeCL` kernels and their launchers.
//!
//! The device passes mirror the host passes one to one:
//!
//! ```text
//! forward:   moments_kernel         cube per row      -> mean, rstd
//!            affine_kernel          cube per row      -> y
//! backward:  backward_stats_kernel  cube per row      -> ds, db
//!            coefficients_kernel    unit per row      -> c1, c2
//!            input_grad_kernel      cube per row      -> dx
//!            param_grad_simple      unit per column   -> dscale, dshift
//!            param_grad_tiled       cube per tile     -> dscale, dshift
//! ```
//!
//! Row reductions stride the columns across the cube, then halve through
//! `SharedMemory` with a `sync_cube()` between steps. Intermediate buffers
//! (`mean`, `rstd`, `ds`, `db`, `c1`, `c2`) stay on the device between
//! launches; only the requested outputs are read back.

use cubecl::bytes::Bytes;
use cubecl::prelude::*;
use cubecl_cuda::CudaRuntime;

use super::interop::{cubecl_bytes_to_f32, f32_to_cubecl_bytes, optional_operand_bytes, F32_BYTES};
use crate::error::{LayerNormError, Result};
use crate::kernels::backward::{BackwardInputs, BackwardOutput, GradientMask};
use crate::kernels::forward::ForwardOutput;
use crate::kernels::{LayerNormConfig, RowLayout};

/// Shared memory slots per array; the largest cube the launchers request.
const MAX_BLOCK_SIZE: u32 = 1024;

/// Padded tile slots for the widest supported tile (32 × 33).
const MAX_TILE_SLOTS: usize = 1056;

/// Units per cube for the one-unit-per-row/column launches.
const LINEAR_CUBE: u32 = 256;

// ============================================================================
// Kernels
// ============================================================================

/// Per-row Welford moments.
///
/// Grid: (rows, 1, 1)
/// Block: (`block_size`, 1, 1)
#[cube(launch)]
fn moments_kernel<F: Float + CubeElement>(
    x: &Array<F>,        // [rows, cols]
    mean: &mut Array<F>, // [rows]
    rstd: &mut Array<F>, // [rows]
    cols: u32,
    eps: F,
    block_size: u32,
) {
    let row = CUBE_POS_X as usize;
    let tid = UNIT_POS_X as usize;
    let base = row * (cols as usize);

    let mut s_count = SharedMemory::<F>::new(1024usize);
    let mut s_mean = SharedMemory::<F>::new(1024usize);
    let mut s_m2 = SharedMemory::<F>::new(1024usize);

    let one = F::cast_from(1.0f32);
    let zero = F::cast_from(0.0f32);
    let mut count = zero;
    let mut running_mean = zero;
    let mut m2 = zero;
    let mut i = tid;
    while i < (cols as usize) {
        let v = x[base + i];
        count = count + one;
        let delta = v - running_mean;
        running_mean = running_mean + delta / count;
        m2 = m2 + delta * (v - running_mean);
        i = i + (block_size as usize);
    }
    s_count[tid] = count;
    s_mean[tid] = running_mean;
    s_m2[tid] = m2;
    sync_cube();

    let mut stride = (block_size / 2) as usize;
    while stride > 0 {
        if tid < stride {
            let partner = tid + stride;
            let cb = s_count[partner];
            if cb > zero {
                let ca = s_count[tid];
                let total = ca + cb;
                let delta = s_mean[partner] - s_mean[tid];
                let share = cb / total;
                s_mean[tid] = s_mean[tid] + delta * share;
                s_m2[tid] = s_m2[tid] + s_m2[partner] + delta * delta * ca * share;
                s_count[tid] = total;
            }
        }
        sync_cube();
        stride = stride / 2;
    }

    if tid == 0 {
        let mut variance = s_m2[0] / F::cast_from(cols as f32);
        if variance < zero {
            variance = zero;
        }
        mean[row] = s_mean[0];
        rstd[row] = one / F::sqrt(variance + eps);
    }
}

/// `y = (x - mean) * rstd * scale + shift`.
///
/// Grid: (rows, 1, 1)
/// Block: (`block_size`, 1, 1)
#[cube(launch)]
fn affine_kernel<F: Float + CubeElement>(
    x: &Array<F>,     // [rows, cols]
    scale: &Array<F>, // [cols] or placeholder
    shift: &Array<F>, // [cols] or placeholder
    mean: &Array<F>,  // [rows]
    rstd: &Array<F>,  // [rows]
    y: &mut Array<F>, // [rows, cols]
    cols: u32,
    has_scale: u32,
    has_shift: u32,
    block_size: u32,
) {
    let row = CUBE_POS_X as usize;
    let tid = UNIT_POS_X as usize;
    let base = row * (cols as usize);
    let row_mean = mean[row];
    let row_rstd = rstd[row];

    let mut i = tid;
    while i < (cols as usize) {
        let mut value = (x[base + i] - row_mean) * row_rstd;
        if has_scale == 1 {
            value = value * scale[i];
        }
        if has_shift == 1 {
            value = value + shift[i];
        }
        y[base + i] = value;
        i = i + (block_size as usize);
    }
}

/// Per-row `ds = Σ dy·x·scale` and `db = Σ dy·scale`.
///
/// Grid: (rows, 1, 1)
/// Block: (`block_size`, 1, 1)
#[cube(launch)]
fn backward_stats_kernel<F: Float + CubeElement>(
    dy: &Array<F>,     // [rows, cols]
    x: &Array<F>,      // [rows, cols]
    scale: &Array<F>,  // [cols] or placeholder
    ds: &mut Array<F>, // [rows]
    db: &mut Array<F>, // [rows]
    cols: u32,
    has_scale: u32,
    block_size: u32,
) {
    let row = CUBE_POS_X as usize;
    let tid = UNIT_POS_X as usize;
    let base = row * (cols as usize);

    let mut s_ds = SharedMemory::<F>::new(1024usize);
    let mut s_db = SharedMemory::<F>::new(1024usize);

    let mut local_ds = F::cast_from(0.0f32);
    let mut local_db = F::cast_from(0.0f32);
    let mut i = tid;
    while i < (cols as usize) {
        let mut g = dy[base + i];
        if has_scale == 1 {
            g = g * scale[i];
        }
        local_ds = local_ds + g * x[base + i];
        local_db = local_db + g;
        i = i + (block_size as usize);
    }
    s_ds[tid] = local_ds;
    s_db[tid] = local_db;
    sync_cube();

    let mut stride = (block_size / 2) as usize;
    while stride > 0 {
        if tid < stride {
            s_ds[tid] = s_ds[tid] + s_ds[tid + stride];
            s_db[tid] = s_db[tid] + s_db[tid + stride];
        }
        sync_cube();
        stride = stride / 2;
    }

    if tid == 0 {
        ds[row] = s_ds[0];
        db[row] = s_db[0];
    }
}

/// Closed-form `(c1, c2)`, one unit per row.
///
/// Grid: (ceil(rows / 256), 1, 1)
/// Block: (256, 1, 1)
#[cube(launch)]
fn coefficients_kernel<F: Float + CubeElement>(
    mean: &Array<F>,
    rstd: &Array<F>,
    ds: &Array<F>,
    db: &Array<F>,
    c1: &mut Array<F>,
    c2: &mut Array<F>,
    rows: u32,
    cols: u32,
) {
    let row = ABSOLUTE_POS as usize;
    if row < (rows as usize) {
        let s = F::cast_from(1.0f32) / F::cast_from(cols as f32);
        let r = rstd[row];
        let m = mean[row];
        let a = (db[row] * m - ds[row]) * r * r * r * s;
        c1[row] = a;
        c2[row] = F::cast_from(0.0f32) - (a * m + db[row] * r * s);
    }
}

/// `dx = rstd·dy·scale + c1·x + c2`.
///
/// Grid: (rows, 1, 1)
/// Block: (`block_size`, 1, 1)
#[cube(launch)]
fn input_grad_kernel<F: Float + CubeElement>(
    dy: &Array<F>,
    x: &Array<F>,
    scale: &Array<F>,
    rstd: &Array<F>,
    c1: &Array<F>,
    c2: &Array<F>,
    dx: &mut Array<F>,
    cols: u32,
    has_scale: u32,
    block_size: u32,
) {
    let row = CUBE_POS_X as usize;
    let tid = UNIT_POS_X as usize;
    let base = row * (cols as usize);
    let r = rstd[row];
    let a = c1[row];
    let b = c2[row];

    let mut i = tid;
    while i < (cols as usize) {
        let mut g = dy[base + i];
        if has_scale == 1 {
            g = g * scale[i];
        }
        dx[base + i] = r * g + a * x[base + i] + b;
        i = i + (block_size as usize);
    }
}

/// One unit per column, serial over rows.
///
/// Grid: (ceil(cols / 256), 1, 1)
/// Block: (256, 1, 1)
#[cube(launch)]
fn param_grad_simple_kernel<F: Float + CubeElement>(
    dy: &Array<F>,
    x: &Array<F>,
    mean: &Array<F>,
    rstd: &Array<F>,
    dscale: &mut Array<F>, // [cols] or placeholder
    dshift: &mut Array<F>, // [cols] or placeholder
    rows: u32,
    cols: u32,
    want_dscale: u32,
    want_dshift: u32,
) {
    let col = ABSOLUTE_POS as usize;
    if col < (cols as usize) {
        let mut g = F::cast_from(0.0f32);
        let mut b = F::cast_from(0.0f32);
        let mut row = 0usize;
        while row < (rows as usize) {
            let index = row * (cols as usize) + col;
            let d = dy[index];
            if want_dscale == 1 {
                g = g + d * (x[index] - mean[row]) * rstd[row];
            }
            if want_dshift == 1 {
                b = b + d;
            }
            row = row + 1;
        }
        if want_dscale == 1 {
            dscale[col] = g;
        }
        if want_dshift == 1 {
            dshift[col] = b;
        }
    }
}

/// Transposed tile reduction, one cube per `tile_width` columns.
///
/// Unit `u` is lane `(tx, ty) = (u % tile_width, u / tile_width)` of a
/// `tile_width × tile_width/2` grid.
///
/// Grid: (ceil(cols / `tile_width`), 1, 1)
/// Block: (`tile_width` * `tile_width` / 2, 1, 1)
#[cube(launch)]
fn param_grad_tiled_kernel<F: Float + CubeElement>(
    dy: &Array<F>,
    x: &Array<F>,
    mean: &Array<F>,
    rstd: &Array<F>,
    dscale: &mut Array<F>,
    dshift: &mut Array<F>,
    rows: u32,
    cols: u32,
    tile_width: u32,
    want_dscale: u32,
    want_dshift: u32,
) {
    let tw = tile_width as usize;
    let tile_rows = tw / 2;
    let stride = tw + 1;
    let tx = (UNIT_POS_X as usize) % tw;
    let ty = (UNIT_POS_X as usize) / tw;
    let first_col = (CUBE_POS_X as usize) * tw;
    let col = first_col + tx;

    let mut t_scale = SharedMemory::<F>::new(1056usize);
    let mut t_shift = SharedMemory::<F>::new(1056usize);

    // two interleaved row stripes per lane
    let zero = F::cast_from(0.0f32);
    let mut g0 = zero;
    let mut g1 = zero;
    let mut b0 = zero;
    let mut b1 = zero;
    if col < (cols as usize) {
        let mut row = ty;
        while row < (rows as usize) {
            let i0 = row * (cols as usize) + col;
            let d0 = dy[i0];
            if want_dscale == 1 {
                g0 = g0 + d0 * (x[i0] - mean[row]) * rstd[row];
            }
            if want_dshift == 1 {
                b0 = b0 + d0;
            }
            let row1 = row + tile_rows;
            if row1 < (rows as usize) {
                let i1 = row1 * (cols as usize) + col;
                let d1 = dy[i1];
                if want_dscale == 1 {
                    g1 = g1 + d1 * (x[i1] - mean[row1]) * rstd[row1];
                }
                if want_dshift == 1 {
                    b1 = b1 + d1;
                }
            }
            row = row + 2 * tile_rows;
        }
    }
    // the flags are cube-uniform, so every unit reaches the same barriers
    if want_dscale == 1 {
        t_scale[ty * stride + tx] = g0;
        t_scale[(ty + tile_rows) * stride + tx] = g1;
    }
    if want_dshift == 1 {
        t_shift[ty * stride + tx] = b0;
        t_shift[(ty + tile_rows) * stride + tx] = b1;
    }
    sync_cube();

    // transposed read: lane (tx, ty) picks stripe tx of columns ty and ty + R
    let mut g_lo = zero;
    let mut g_hi = zero;
    let mut b_lo = zero;
    let mut b_hi = zero;
    if want_dscale == 1 {
        g_lo = t_scale[tx * stride + ty];
        g_hi = t_scale[tx * stride + ty + tile_rows];
    }
    if want_dshift == 1 {
        b_lo = t_shift[tx * stride + ty];
        b_hi = t_shift[tx * stride + ty + tile_rows];
    }
    sync_cube();
    if want_dscale == 1 {
        t_scale[ty * stride + tx] = g_lo;
        t_scale[(ty + tile_rows) * stride + tx] = g_hi;
    }
    if want_dshift == 1 {
        t_shift[ty * stride + tx] = b_lo;
        t_shift[(ty + tile_rows) * stride + tx] = b_hi;
    }
    sync_cube();

    let mut offset = tw / 2;
    while offset > 0 {
        if tx < offset {
            let lo = ty * stride + tx;
            let hi = (ty + tile_rows) * stride + tx;
            if want_dscale == 1 {
                t_scale[lo] = t_scale[lo] + t_scale[lo + offset];
                t_scale[hi] = t_scale[hi] + t_scale[hi + offset];
            }
            if want_dshift == 1 {
                t_shift[lo] = t_shift[lo] + t_shift[lo + offset];
                t_shift[hi] = t_shift[hi] + t_shift[hi + offset];
            }
        }
        sync_cube();
        offset = offset / 2;
    }

    if tx == 0 {
        let col_lo = first_col + ty;
        let col_hi = first_col + ty + tile_rows;
        if col_lo < (cols as usize) {
            if want_dscale == 1 {
                dscale[col_lo] = t_scale[ty * stride];
            }
            if want_dshift == 1 {
                dshift[col_lo] = t_shift[ty * stride];
            }
        }
        if col_hi < (cols as usize) {
            if want_dscale == 1 {
                dscale[col_hi] = t_scale[(ty + tile_rows) * stride];
            }
            if want_dshift == 1 {
                dshift[col_hi] = t_shift[(ty + tile_rows) * stride];
            }
        }
    }
}

// ============================================================================
// Launchers
// ============================================================================

/// Cube width for a row pass: a power of two covering `cols`, clamped to
/// the configured block and the shared-memory slots.
fn row_cube_width(cols: usize, config: &LayerNormConfig) -> u32 {
    let lanes = config.lanes_for_row(cols).next_power_of_two();
    u32::try_from(lanes).map_or(MAX_BLOCK_SIZE, |lanes| lanes.min(MAX_BLOCK_SIZE))
}

fn check_tile_width(config: &LayerNormConfig) -> Result<()> {
    if config.tile_width * (config.tile_width + 1) > MAX_TILE_SLOTS {
        return Err(LayerNormError::InvalidConfig(format!(
            "device tiles hold at most {MAX_TILE_SLOTS} slots, tile width {} needs {}",
            config.tile_width,
            config.tile_width * (config.tile_width + 1)
        )));
    }
    Ok(())
}

/// Fail with [`LayerNormError::DeviceNotAvailable`] when CUDA device 0
/// cannot be opened, before any `CubeCL` client is created.
fn ensure_cuda_device() -> Result<()> {
    candle_core::Device::new_cuda(0)
        .map(|_| ())
        .map_err(|e| LayerNormError::DeviceNotAvailable(format!("CUDA device 0: {e}")))
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        LayerNormError::InvalidConfig(format!("{what} {value} exceeds the u32 grid range"))
    })
}

/// Forward pass on CUDA device 0.
///
/// Same contract as [`crate::kernels::layer_norm_forward`] for `f32`.
///
/// # Errors
/// Precondition failures as on the host,
/// [`LayerNormError::DeviceNotAvailable`] when device 0 cannot be opened,
/// plus [`LayerNormError::Kernel`] for a failed launch or read-back.
#[allow(clippy::cast_possible_truncation)]
pub fn layer_norm_forward_cuda(
    x: &[f32],
    scale: Option<&[f32]>,
    shift: Option<&[f32]>,
    layout: RowLayout,
    eps: f64,
    config: &LayerNormConfig,
) -> Result<ForwardOutput<f32>> {
    config.validate()?;
    layout.check_cols()?;
    layout.check_matrix("x", x.len())?;
    layout.check_optional_per_col("scale", scale.map(<[f32]>::len))?;
    layout.check_optional_per_col("shift", shift.map(<[f32]>::len))?;
    if layout.is_empty() {
        return Ok(ForwardOutput {
            y: Vec::new(),
            mean: Vec::new(),
            rstd: Vec::new(),
        });
    }

    let RowLayout { rows, cols } = layout;
    let numel = layout.numel();
    let block_size = row_cube_width(cols, config);
    tracing::debug!(rows, cols, block_size, "cubecl layer norm forward");

    ensure_cuda_device()?;
    let device = cubecl_cuda::CudaDevice::new(0);
    let client = CudaRuntime::client(&device);

    let (scale_bytes, scale_len, has_scale) = optional_operand_bytes(scale);
    let (shift_bytes, shift_len, has_shift) = optional_operand_bytes(shift);
    let x_handle = client.create(Bytes::from_bytes_vec(f32_to_cubecl_bytes(x)));
    let scale_handle = client.create(Bytes::from_bytes_vec(scale_bytes));
    let shift_handle = client.create(Bytes::from_bytes_vec(shift_bytes));
    let mean_handle = client.empty(rows * F32_BYTES);
    let rstd_handle = client.empty(rows * F32_BYTES);
    let y_handle = client.empty(numel * F32_BYTES);

    let row_count = CubeCount::Static(to_u32(rows, "row count")?, 1, 1);
    let cols_u32 = to_u32(cols, "column count")?;

    // SAFETY: every handle was created above with the element count passed here
    unsafe {
        moments_kernel::launch::<f32, CudaRuntime>(
            &client,
            row_count.clone(),
            CubeDim::new(&client, block_size as usize),
            ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
            ArrayArg::from_raw_parts::<f32>(&mean_handle, rows, 1),
            ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
            ScalarArg::new(cols_u32),
            ScalarArg::new(eps as f32),
            ScalarArg::new(block_size),
        )
        .map_err(|e| LayerNormError::Kernel(format!("moments_kernel launch failed: {e}")))?;

        affine_kernel::launch::<f32, CudaRuntime>(
            &client,
            row_count,
            CubeDim::new(&client, block_size as usize),
            ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
            ArrayArg::from_raw_parts::<f32>(&scale_handle, scale_len, 1),
            ArrayArg::from_raw_parts::<f32>(&shift_handle, shift_len, 1),
            ArrayArg::from_raw_parts::<f32>(&mean_handle, rows, 1),
            ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
            ArrayArg::from_raw_parts::<f32>(&y_handle, numel, 1),
            ScalarArg::new(cols_u32),
            ScalarArg::new(has_scale),
            ScalarArg::new(has_shift),
            ScalarArg::new(block_size),
        )
        .map_err(|e| LayerNormError::Kernel(format!("affine_kernel launch failed: {e}")))?;
    }

    Ok(ForwardOutput {
        y: cubecl_bytes_to_f32(&client.read_one(y_handle), numel)?,
        mean: cubecl_bytes_to_f32(&client.read_one(mean_handle), rows)?,
        rstd: cubecl_bytes_to_f32(&client.read_one(rstd_handle), rows)?,
    })
}

/// Backward pass on CUDA device 0.
///
/// Same contract as [`crate::kernels::layer_norm_backward`] for `f32`.
///
/// # Errors
/// Precondition failures as on the host, a tile width beyond the device
/// scratch, [`LayerNormError::DeviceNotAvailable`] when device 0 cannot be
/// opened, plus [`LayerNormError::Kernel`] for a failed launch or
/// read-back.
#[allow(clippy::too_many_lines)]
pub fn layer_norm_backward_cuda(
    inputs: &BackwardInputs<'_, f32>,
    layout: RowLayout,
    mask: GradientMask,
    config: &LayerNormConfig,
) -> Result<BackwardOutput<f32>> {
    config.validate()?;
    check_tile_width(config)?;
    layout.check_cols()?;
    layout.check_matrix("dy", inputs.dy.len())?;
    layout.check_matrix("x", inputs.x.len())?;
    layout.check_per_row("mean", inputs.mean.len())?;
    layout.check_per_row("rstd", inputs.rstd.len())?;
    layout.check_optional_per_col("scale", inputs.scale.map(<[f32]>::len))?;

    let RowLayout { rows, cols } = layout;
    if layout.is_empty() || mask.is_empty() {
        return Ok(BackwardOutput {
            dx: mask.dx.then(Vec::new),
            dscale: mask.dscale.then(|| vec![0.0; cols]),
            dshift: mask.dshift.then(|| vec![0.0; cols]),
        });
    }

    let numel = layout.numel();
    let block_size = row_cube_width(cols, config);
    let tiled = config.use_tiled_reduction(rows);
    tracing::debug!(
        rows,
        cols,
        block_size,
        tiled,
        dx = mask.dx,
        dscale = mask.dscale,
        dshift = mask.dshift,
        "cubecl layer norm backward"
    );

    ensure_cuda_device()?;
    let device = cubecl_cuda::CudaDevice::new(0);
    let client = CudaRuntime::client(&device);

    let (scale_bytes, scale_len, has_scale) = optional_operand_bytes(inputs.scale);
    let dy_handle = client.create(Bytes::from_bytes_vec(f32_to_cubecl_bytes(inputs.dy)));
    let x_handle = client.create(Bytes::from_bytes_vec(f32_to_cubecl_bytes(inputs.x)));
    let mean_handle = client.create(Bytes::from_bytes_vec(f32_to_cubecl_bytes(inputs.mean)));
    let rstd_handle = client.create(Bytes::from_bytes_vec(f32_to_cubecl_bytes(inputs.rstd)));
    let scale_handle = client.create(Bytes::from_bytes_vec(scale_bytes));

    let rows_u32 = to_u32(rows, "row count")?;
    let cols_u32 = to_u32(cols, "column count")?;

    let dx = if mask.dx {
        let ds_handle = client.empty(rows * F32_BYTES);
        let db_handle = client.empty(rows * F32_BYTES);
        let c1_handle = client.empty(rows * F32_BYTES);
        let c2_handle = client.empty(rows * F32_BYTES);
        let dx_handle = client.empty(numel * F32_BYTES);
        let row_count = CubeCount::Static(rows_u32, 1, 1);

        // SAFETY: every handle was created above with the element count passed here
        unsafe {
            backward_stats_kernel::launch::<f32, CudaRuntime>(
                &client,
                row_count.clone(),
                CubeDim::new(&client, block_size as usize),
                ArrayArg::from_raw_parts::<f32>(&dy_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&scale_handle, scale_len, 1),
                ArrayArg::from_raw_parts::<f32>(&ds_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&db_handle, rows, 1),
                ScalarArg::new(cols_u32),
                ScalarArg::new(has_scale),
                ScalarArg::new(block_size),
            )
            .map_err(|e| {
                LayerNormError::Kernel(format!("backward_stats_kernel launch failed: {e}"))
            })?;

            coefficients_kernel::launch::<f32, CudaRuntime>(
                &client,
                CubeCount::Static(rows_u32.div_ceil(LINEAR_CUBE), 1, 1),
                CubeDim::new(&client, LINEAR_CUBE as usize),
                ArrayArg::from_raw_parts::<f32>(&mean_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&ds_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&db_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&c1_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&c2_handle, rows, 1),
                ScalarArg::new(rows_u32),
                ScalarArg::new(cols_u32),
            )
            .map_err(|e| {
                LayerNormError::Kernel(format!("coefficients_kernel launch failed: {e}"))
            })?;

            input_grad_kernel::launch::<f32, CudaRuntime>(
                &client,
                row_count,
                CubeDim::new(&client, block_size as usize),
                ArrayArg::from_raw_parts::<f32>(&dy_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&scale_handle, scale_len, 1),
                ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&c1_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&c2_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&dx_handle, numel, 1),
                ScalarArg::new(cols_u32),
                ScalarArg::new(has_scale),
                ScalarArg::new(block_size),
            )
            .map_err(|e| LayerNormError::Kernel(format!("input_grad_kernel launch failed: {e}")))?;
        }
        Some(cubecl_bytes_to_f32(&client.read_one(dx_handle), numel)?)
    } else {
        None
    };

    if !(mask.dscale || mask.dshift) {
        return Ok(BackwardOutput {
            dx,
            dscale: None,
            dshift: None,
        });
    }

    let param_len = |wanted: bool| if wanted { cols } else { 1 };
    let dscale_handle = client.empty(param_len(mask.dscale) * F32_BYTES);
    let dshift_handle = client.empty(param_len(mask.dshift) * F32_BYTES);
    let want_dscale = u32::from(mask.dscale);
    let want_dshift = u32::from(mask.dshift);

    // SAFETY: every handle was created above with the element count passed here
    unsafe {
        if tiled {
            let tile_width = to_u32(config.tile_width, "tile width")?;
            param_grad_tiled_kernel::launch::<f32, CudaRuntime>(
                &client,
                CubeCount::Static(to_u32(config.num_tiles(cols), "tile count")?, 1, 1),
                CubeDim::new(&client, config.tile_width * config.tile_rows()),
                ArrayArg::from_raw_parts::<f32>(&dy_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&mean_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&dscale_handle, param_len(mask.dscale), 1),
                ArrayArg::from_raw_parts::<f32>(&dshift_handle, param_len(mask.dshift), 1),
                ScalarArg::new(rows_u32),
                ScalarArg::new(cols_u32),
                ScalarArg::new(tile_width),
                ScalarArg::new(want_dscale),
                ScalarArg::new(want_dshift),
            )
            .map_err(|e| {
                LayerNormError::Kernel(format!("param_grad_tiled_kernel launch failed: {e}"))
            })?;
        } else {
            param_grad_simple_kernel::launch::<f32, CudaRuntime>(
                &client,
                CubeCount::Static(cols_u32.div_ceil(LINEAR_CUBE), 1, 1),
                CubeDim::new(&client, LINEAR_CUBE as usize),
                ArrayArg::from_raw_parts::<f32>(&dy_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&x_handle, numel, 1),
                ArrayArg::from_raw_parts::<f32>(&mean_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&rstd_handle, rows, 1),
                ArrayArg::from_raw_parts::<f32>(&dscale_handle, param_len(mask.dscale), 1),
                ArrayArg::from_raw_parts::<f32>(&dshift_handle, param_len(mask.dshift), 1),
                ScalarArg::new(rows_u32),
                ScalarArg::new(cols_u32),
                ScalarArg::new(want_dscale),
                ScalarArg::new(want_dshift),
            )
            .map_err(|e| {
                LayerNormError::Kernel(format!("param_grad_simple_kernel launch failed: {e}"))
            })?;
        }
    }

    let dscale = if mask.dscale {
        Some(cubecl_bytes_to_f32(&client.read_one(dscale_handle), cols)?)
    } else {
        None
    };
    let dshift = if mask.dshift {
        Some(cubecl_bytes_to_f32(&client.read_one(dshift_handle), cols)?)
    } else {
        None
    };
    Ok(BackwardOutput { dx, dscale, dshift })
}
