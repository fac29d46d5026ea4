// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Layer normalization over Candle tensors.
//!
//! The trailing `normalized_shape` dims of the input form one row of `N`
//! features; every leading index is an independent row. The facade
//! flattens the tensors, dispatches on dtype and device, runs the flat
//! passes, and restores the shapes:
//!
//! - `output` has the input's shape,
//! - `mean`/`rstd` keep the leading dims with the normalized dims set to 1,
//!   stored in the accumulator dtype (`f32` for `f16`/`bf16`/`f32`, `f64`
//!   for `f64`).
//!
//! `f32` tensors on a CUDA device run the `CubeCL` kernels when the crate
//! is built with the `cuda` feature. Everything else runs the host passes.

use candle_core::{DType, Device, Tensor, WithDType};
use half::{bf16, f16};

use super::backward::{
    layer_norm_backward as backward_pass, BackwardInputs, BackwardOutput, GradientMask,
};
use super::forward::{layer_norm_forward as forward_pass, ForwardOutput};
use super::{LayerNormConfig, RowLayout};
use crate::error::{LayerNormError, Result};
use crate::precision::{accumulator_dtype, NormElement};

type ForwardPass<T> = fn(
    &[T],
    Option<&[T]>,
    Option<&[T]>,
    RowLayout,
    f64,
    &LayerNormConfig,
) -> Result<ForwardOutput<T>>;

type BackwardPass<T> = fn(
    &BackwardInputs<'_, T>,
    RowLayout,
    GradientMask,
    &LayerNormConfig,
) -> Result<BackwardOutput<T>>;

/// Forward results.
#[derive(Debug, Clone)]
pub struct LayerNormStats {
    /// Normalized output, same shape as the input
    pub output: Tensor,
    /// Per-row mean, `leading dims + [1; normalized rank]`
    pub mean: Tensor,
    /// Per-row reciprocal standard deviation, shaped like `mean`
    pub rstd: Tensor,
}

/// Backward results; `None` where not requested.
#[derive(Debug, Clone)]
pub struct LayerNormGrads {
    /// Gradient w.r.t. the input
    pub dx: Option<Tensor>,
    /// Gradient w.r.t. the weight, shaped `normalized_shape`
    pub dweight: Option<Tensor>,
    /// Gradient w.r.t. the bias, shaped `normalized_shape`
    pub dbias: Option<Tensor>,
}

/// Layer normalization module with optional elementwise affine parameters.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use layernorm_rs::kernels::LayerNorm;
///
/// let norm = LayerNorm::new(&[64], 1e-5, true, DType::F32, &Device::Cpu)?;
/// let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &Device::Cpu)?;
/// let y = norm.forward(&x)?;
/// assert_eq!(y.dims(), &[2, 8, 64]);
/// # Ok::<(), layernorm_rs::LayerNormError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    normalized_shape: Vec<usize>,
    eps: f64,
    config: LayerNormConfig,
}

impl LayerNorm {
    /// Create a layer with weight 1 and bias 0, or without parameters.
    ///
    /// # Arguments
    /// * `normalized_shape` - Trailing dims normalized together
    /// * `eps` - Added to the variance before the square root
    /// * `elementwise_affine` - Allocate weight and bias
    /// * `dtype` - Parameter dtype; must match the inputs
    /// * `device` - Device for the parameters
    ///
    /// # Errors
    /// Returns an error for an empty `normalized_shape` or an unsupported
    /// dtype.
    pub fn new(
        normalized_shape: &[usize],
        eps: f64,
        elementwise_affine: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        check_normalized_shape(normalized_shape)?;
        accumulator_dtype(dtype)?;
        let (weight, bias) = if elementwise_affine {
            (
                Some(Tensor::ones(normalized_shape.to_vec(), dtype, device)?),
                Some(Tensor::zeros(normalized_shape.to_vec(), dtype, device)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            weight,
            bias,
            normalized_shape: normalized_shape.to_vec(),
            eps,
            config: LayerNormConfig::default(),
        })
    }

    /// Build a layer from existing parameters.
    ///
    /// # Errors
    /// Returns an error if a parameter is not shaped `normalized_shape` or
    /// the two parameters disagree on dtype.
    pub fn from_parts(
        weight: Option<Tensor>,
        bias: Option<Tensor>,
        normalized_shape: &[usize],
        eps: f64,
    ) -> Result<Self> {
        check_normalized_shape(normalized_shape)?;
        for param in weight.iter().chain(bias.iter()) {
            check_param_shape(param, normalized_shape)?;
        }
        if let (Some(w), Some(b)) = (&weight, &bias) {
            check_dtype(w.dtype(), b.dtype())?;
        }
        Ok(Self {
            weight,
            bias,
            normalized_shape: normalized_shape.to_vec(),
            eps,
            config: LayerNormConfig::default(),
        })
    }

    /// Replace the launch configuration.
    #[must_use]
    pub fn with_config(mut self, config: LayerNormConfig) -> Self {
        self.config = config;
        self
    }

    /// Scale parameter, if any.
    #[must_use]
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Shift parameter, if any.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Trailing dims normalized together.
    #[must_use]
    pub fn normalized_shape(&self) -> &[usize] {
        &self.normalized_shape
    }

    /// Variance epsilon.
    #[must_use]
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Launch configuration.
    #[must_use]
    pub fn config(&self) -> &LayerNormConfig {
        &self.config
    }

    /// Normalize `x`.
    ///
    /// # Errors
    /// See [`layer_norm`].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_stats(x)?.output)
    }

    /// Normalize `x` and keep the statistics for [`Self::backward`].
    ///
    /// # Errors
    /// See [`layer_norm`].
    pub fn forward_with_stats(&self, x: &Tensor) -> Result<LayerNormStats> {
        forward_with_config(
            x,
            self.weight.as_ref(),
            self.bias.as_ref(),
            &self.normalized_shape,
            self.eps,
            &self.config,
        )
    }

    /// Gradients for upstream `dy`, given the input and saved statistics.
    ///
    /// # Errors
    /// See [`layer_norm_backward`].
    pub fn backward(
        &self,
        dy: &Tensor,
        x: &Tensor,
        stats: &LayerNormStats,
        mask: GradientMask,
    ) -> Result<LayerNormGrads> {
        backward_with_config(
            dy,
            x,
            &stats.mean,
            &stats.rstd,
            self.weight.as_ref(),
            &self.normalized_shape,
            mask,
            &self.config,
        )
    }
}

/// Normalize the trailing `normalized_shape` dims of `x`.
///
/// # Errors
/// Returns an error if the trailing dims of `x` are not `normalized_shape`,
/// a parameter has the wrong shape or dtype, the dtype is not a supported
/// float, or a device launch fails.
pub fn layer_norm(
    x: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    normalized_shape: &[usize],
    eps: f64,
) -> Result<LayerNormStats> {
    forward_with_config(x, weight, bias, normalized_shape, eps, &LayerNormConfig::default())
}

/// Gradients of [`layer_norm`].
///
/// # Errors
/// Returns an error if `dy` and `x` disagree in shape or dtype, `mean` or
/// `rstd` do not hold one accumulator-dtype value per row, `weight` has
/// the wrong shape or dtype, or a device launch fails.
pub fn layer_norm_backward(
    dy: &Tensor,
    x: &Tensor,
    mean: &Tensor,
    rstd: &Tensor,
    weight: Option<&Tensor>,
    normalized_shape: &[usize],
    mask: GradientMask,
) -> Result<LayerNormGrads> {
    backward_with_config(
        dy,
        x,
        mean,
        rstd,
        weight,
        normalized_shape,
        mask,
        &LayerNormConfig::default(),
    )
}

/// `(M, N)` view of a tensor and the shape of its per-row statistics.
#[derive(Debug)]
struct Geometry {
    layout: RowLayout,
    stat_shape: Vec<usize>,
}

impl Geometry {
    fn resolve(dims: &[usize], normalized_shape: &[usize]) -> Result<Self> {
        check_normalized_shape(normalized_shape)?;
        let split = dims.len().checked_sub(normalized_shape.len());
        let Some(split) = split.filter(|&split| dims[split..] == *normalized_shape) else {
            return Err(LayerNormError::ShapeMismatch {
                expected: normalized_shape.to_vec(),
                actual: dims.to_vec(),
            });
        };
        let leading = &dims[..split];
        let stat_shape = leading
            .iter()
            .copied()
            .chain(std::iter::repeat(1).take(normalized_shape.len()))
            .collect();
        Ok(Self {
            layout: RowLayout::new(leading.iter().product(), normalized_shape.iter().product()),
            stat_shape,
        })
    }
}

fn check_normalized_shape(normalized_shape: &[usize]) -> Result<()> {
    if normalized_shape.is_empty() {
        return Err(LayerNormError::InvalidConfig(
            "normalized_shape must name at least one dim".to_string(),
        ));
    }
    Ok(())
}

fn check_dtype(expected: DType, actual: DType) -> Result<()> {
    if expected != actual {
        return Err(LayerNormError::DTypeMismatch { expected, actual });
    }
    Ok(())
}

fn check_param_shape(param: &Tensor, normalized_shape: &[usize]) -> Result<()> {
    if param.dims() != normalized_shape {
        return Err(LayerNormError::ShapeMismatch {
            expected: normalized_shape.to_vec(),
            actual: param.dims().to_vec(),
        });
    }
    Ok(())
}

fn check_param(param: &Tensor, normalized_shape: &[usize], dtype: DType) -> Result<()> {
    check_param_shape(param, normalized_shape)?;
    check_dtype(dtype, param.dtype())
}

fn check_stat(stat: &Tensor, geometry: &Geometry, dtype: DType) -> Result<()> {
    if stat.elem_count() != geometry.layout.rows {
        return Err(LayerNormError::ShapeMismatch {
            expected: geometry.stat_shape.clone(),
            actual: stat.dims().to_vec(),
        });
    }
    check_dtype(dtype, stat.dtype())
}

fn host_vec<T: WithDType>(tensor: &Tensor) -> Result<Vec<T>> {
    Ok(tensor.flatten_all()?.to_vec1::<T>()?)
}

fn forward_with_config(
    x: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    normalized_shape: &[usize],
    eps: f64,
    config: &LayerNormConfig,
) -> Result<LayerNormStats> {
    let geometry = Geometry::resolve(x.dims(), normalized_shape)?;
    let dtype = x.dtype();
    for param in weight.iter().chain(bias.iter()) {
        check_param(param, normalized_shape, dtype)?;
    }
    tracing::debug!(
        shape = ?x.dims(),
        ?dtype,
        rows = geometry.layout.rows,
        cols = geometry.layout.cols,
        "layer norm tensor forward"
    );

    match dtype {
        DType::F16 => {
            forward_typed::<f16>(x, weight, bias, &geometry, eps, config, forward_pass::<f16>)
        }
        DType::BF16 => {
            forward_typed::<bf16>(x, weight, bias, &geometry, eps, config, forward_pass::<bf16>)
        }
        DType::F32 => {
            let pass = f32_forward_pass(x.device());
            forward_typed::<f32>(x, weight, bias, &geometry, eps, config, pass)
        }
        DType::F64 => {
            forward_typed::<f64>(x, weight, bias, &geometry, eps, config, forward_pass::<f64>)
        }
        other => Err(LayerNormError::UnsupportedDType(other)),
    }
}

fn f32_forward_pass(device: &Device) -> ForwardPass<f32> {
    #[cfg(feature = "cuda")]
    {
        if device.is_cuda() {
            tracing::debug!("using CubeCL layer norm forward");
            return super::cubecl::layer_norm_forward_cuda;
        }
    }
    tracing::debug!(?device, "using host layer norm forward");
    forward_pass::<f32>
}

fn f32_backward_pass(device: &Device) -> BackwardPass<f32> {
    #[cfg(feature = "cuda")]
    {
        if device.is_cuda() {
            tracing::debug!("using CubeCL layer norm backward");
            return super::cubecl::layer_norm_backward_cuda;
        }
    }
    tracing::debug!(?device, "using host layer norm backward");
    backward_pass::<f32>
}

fn forward_typed<T>(
    x: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    geometry: &Geometry,
    eps: f64,
    config: &LayerNormConfig,
    pass: ForwardPass<T>,
) -> Result<LayerNormStats>
where
    T: NormElement,
    T::Acc: WithDType,
{
    let device = x.device();
    let xs = host_vec::<T>(x)?;
    let scale = weight.map(host_vec::<T>).transpose()?;
    let shift = bias.map(host_vec::<T>).transpose()?;

    let out = pass(&xs, scale.as_deref(), shift.as_deref(), geometry.layout, eps, config)?;
    Ok(LayerNormStats {
        output: Tensor::from_vec(out.y, x.shape(), device)?,
        mean: Tensor::from_vec(out.mean, geometry.stat_shape.clone(), device)?,
        rstd: Tensor::from_vec(out.rstd, geometry.stat_shape.clone(), device)?,
    })
}

#[allow(clippy::too_many_arguments)]
fn backward_with_config(
    dy: &Tensor,
    x: &Tensor,
    mean: &Tensor,
    rstd: &Tensor,
    weight: Option<&Tensor>,
    normalized_shape: &[usize],
    mask: GradientMask,
    config: &LayerNormConfig,
) -> Result<LayerNormGrads> {
    let geometry = Geometry::resolve(x.dims(), normalized_shape)?;
    let dtype = x.dtype();
    if dy.dims() != x.dims() {
        return Err(LayerNormError::ShapeMismatch {
            expected: x.dims().to_vec(),
            actual: dy.dims().to_vec(),
        });
    }
    check_dtype(dtype, dy.dtype())?;
    let acc_dtype = accumulator_dtype(dtype)?;
    check_stat(mean, &geometry, acc_dtype)?;
    check_stat(rstd, &geometry, acc_dtype)?;
    if let Some(weight) = weight {
        check_param(weight, normalized_shape, dtype)?;
    }
    tracing::debug!(
        shape = ?x.dims(),
        ?dtype,
        rows = geometry.layout.rows,
        cols = geometry.layout.cols,
        ?mask,
        "layer norm tensor backward"
    );
    if mask.is_empty() {
        tracing::debug!("layer norm tensor backward: no gradients requested");
        return Ok(LayerNormGrads {
            dx: None,
            dweight: None,
            dbias: None,
        });
    }

    let args = BackwardArgs {
        dy,
        x,
        mean,
        rstd,
        weight,
        normalized_shape,
        layout: geometry.layout,
        mask,
        config,
    };
    match dtype {
        DType::F16 => args.run::<f16>(backward_pass::<f16>),
        DType::BF16 => args.run::<bf16>(backward_pass::<bf16>),
        DType::F32 => args.run::<f32>(f32_backward_pass(x.device())),
        DType::F64 => args.run::<f64>(backward_pass::<f64>),
        other => Err(LayerNormError::UnsupportedDType(other)),
    }
}

/// Validated backward operands, ready for a typed run.
struct BackwardArgs<'a> {
    dy: &'a Tensor,
    x: &'a Tensor,
    mean: &'a Tensor,
    rstd: &'a Tensor,
    weight: Option<&'a Tensor>,
    normalized_shape: &'a [usize],
    layout: RowLayout,
    mask: GradientMask,
    config: &'a LayerNormConfig,
}

impl BackwardArgs<'_> {
    fn run<T>(&self, pass: BackwardPass<T>) -> Result<LayerNormGrads>
    where
        T: NormElement,
        T::Acc: WithDType,
    {
        let device = self.x.device();
        let dy = host_vec::<T>(self.dy)?;
        let x = host_vec::<T>(self.x)?;
        let mean = host_vec::<T::Acc>(self.mean)?;
        let rstd = host_vec::<T::Acc>(self.rstd)?;
        let scale = self.weight.map(host_vec::<T>).transpose()?;

        let inputs = BackwardInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            rstd: &rstd,
            scale: scale.as_deref(),
        };
        let out = pass(&inputs, self.layout, self.mask, self.config)?;

        let param = |grad: Option<Vec<T>>| {
            grad.map(|g| Tensor::from_vec(g, self.normalized_shape.to_vec(), device))
                .transpose()
        };
        Ok(LayerNormGrads {
            dx: out
                .dx
                .map(|dx| Tensor::from_vec(dx, self.x.shape(), device))
                .transpose()?,
            dweight: param(out.dscale)?,
            dbias: param(out.dshift)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(x: &Tensor, eps: f64) -> Tensor {
        let last = x.rank() - 1;
        let mean = x.mean_keepdim(last).unwrap();
        let centered = x.broadcast_sub(&mean).unwrap();
        let var = centered.sqr().unwrap().mean_keepdim(last).unwrap();
        centered
            .broadcast_div(&(var + eps).unwrap().sqrt().unwrap())
            .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_layer_norm_creation() {
        let norm = LayerNorm::new(&[768], 1e-5, true, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(norm.weight().unwrap().dims(), &[768]);
        assert_eq!(norm.bias().unwrap().dims(), &[768]);
        let bare = LayerNorm::new(&[768], 1e-5, false, DType::F32, &Device::Cpu).unwrap();
        assert!(bare.weight().is_none() && bare.bias().is_none());
    }

    #[test]
    fn test_forward_matches_reference() {
        let device = Device::Cpu;
        let norm = LayerNorm::new(&[96], 1e-5, true, DType::F32, &device).unwrap();
        let x = Tensor::randn(0.0f32, 3.0, (2, 5, 96), &device).unwrap();
        let stats = norm.forward_with_stats(&x).unwrap();
        assert_eq!(stats.output.dims(), &[2, 5, 96]);
        assert_eq!(stats.mean.dims(), &[2, 5, 1]);
        assert_eq!(stats.rstd.dtype(), DType::F32);
        assert!(max_abs_diff(&stats.output, &reference(&x, 1e-5)) < 1e-4);
    }

    #[test]
    fn test_multi_dim_normalized_shape() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f64, 1.0, (3, 4, 5), &device).unwrap();
        let stats = layer_norm(&x, None, None, &[4, 5], 1e-5).unwrap();
        assert_eq!(stats.mean.dims(), &[3, 1, 1]);
        let flat = reference(&x.reshape((3, 20)).unwrap(), 1e-5)
            .reshape((3, 4, 5))
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        let got = stats.output.to_dtype(DType::F32).unwrap();
        assert!(max_abs_diff(&got, &flat) < 1e-6);
    }

    #[test]
    fn test_half_inputs_keep_f32_stats() {
        let device = Device::Cpu;
        for dtype in [DType::F16, DType::BF16] {
            let x = Tensor::randn(0.0f32, 1.0, (4, 64), &device)
                .unwrap()
                .to_dtype(dtype)
                .unwrap();
            let norm = LayerNorm::new(&[64], 1e-5, true, dtype, &device).unwrap();
            let stats = norm.forward_with_stats(&x).unwrap();
            assert_eq!(stats.output.dtype(), dtype);
            assert_eq!(stats.mean.dtype(), DType::F32);
            assert_eq!(stats.rstd.dtype(), DType::F32);
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 8), DType::F32, &device).unwrap();

        let err = layer_norm(&x, None, None, &[7], 1e-5).unwrap_err();
        assert!(matches!(err, LayerNormError::ShapeMismatch { .. }));

        let w = Tensor::ones(8, DType::F64, &device).unwrap();
        let err = layer_norm(&x, Some(&w), None, &[8], 1e-5).unwrap_err();
        assert!(matches!(err, LayerNormError::DTypeMismatch { .. }));

        let ints = Tensor::zeros((2, 8), DType::U32, &device).unwrap();
        let err = layer_norm(&ints, None, None, &[8], 1e-5).unwrap_err();
        assert!(matches!(err, LayerNormError::UnsupportedDType(DType::U32)));

        let err = layer_norm(&x, None, None, &[], 1e-5).unwrap_err();
        assert!(matches!(err, LayerNormError::InvalidConfig(_)));
    }

    #[test]
    fn test_backward_shapes_and_mask() {
        let device = Device::Cpu;
        let norm = LayerNorm::new(&[32], 1e-5, true, DType::F32, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (3, 7, 32), &device).unwrap();
        let dy = Tensor::randn(0.0f32, 1.0, (3, 7, 32), &device).unwrap();
        let stats = norm.forward_with_stats(&x).unwrap();

        let grads = norm.backward(&dy, &x, &stats, GradientMask::ALL).unwrap();
        assert_eq!(grads.dx.unwrap().dims(), &[3, 7, 32]);
        assert_eq!(grads.dweight.unwrap().dims(), &[32]);
        assert_eq!(grads.dbias.unwrap().dims(), &[32]);

        let grads = norm.backward(&dy, &x, &stats, GradientMask::PARAMS).unwrap();
        assert!(grads.dx.is_none());

        let none = GradientMask {
            dx: false,
            dscale: false,
            dshift: false,
        };
        assert!(none.is_empty());
        let grads = norm.backward(&dy, &x, &stats, none).unwrap();
        assert!(grads.dx.is_none() && grads.dweight.is_none() && grads.dbias.is_none());
    }

    #[test]
    fn test_from_parts_validation() {
        let device = Device::Cpu;
        let w = Tensor::ones(16, DType::F32, &device).unwrap();
        let b = Tensor::zeros(16, DType::F32, &device).unwrap();
        let norm = LayerNorm::from_parts(Some(w.clone()), Some(b), &[16], 1e-5).unwrap();
        assert_eq!(norm.normalized_shape(), &[16]);

        let short = Tensor::zeros(15, DType::F32, &device).unwrap();
        let err = LayerNorm::from_parts(Some(w.clone()), Some(short), &[16], 1e-5).unwrap_err();
        assert!(matches!(err, LayerNormError::ShapeMismatch { .. }));

        let wide = Tensor::zeros(16, DType::F64, &device).unwrap();
        let err = LayerNorm::from_parts(Some(w), Some(wide), &[16], 1e-5).unwrap_err();
        assert!(matches!(
            err,
            LayerNormError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::F64
            }
        ));
    }

    #[test]
    fn test_backward_rejects_wide_stats_for_half() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4), DType::F16, &device).unwrap();
        let stat = Tensor::zeros((2, 1), DType::F16, &device).unwrap();
        let err = layer_norm_backward(&x, &x, &stat, &stat, None, &[4], GradientMask::ALL)
            .unwrap_err();
        assert!(matches!(
            err,
            LayerNormError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::F16
            }
        ));
    }
}
