//! `CubeCL` vs host parity for the layer norm passes.

#[cfg(feature = "cuda")]
mod cuda_tests {
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};
    use layernorm_rs::kernels::cubecl::{layer_norm_backward_cuda, layer_norm_forward_cuda};
    use layernorm_rs::kernels::{
        layer_norm_backward, layer_norm_forward, BackwardInputs, GradientMask, LayerNorm,
        LayerNormConfig,
    };
    use layernorm_rs::LayerNormError;

    use crate::helpers::{LayerNormCase, ValidationUtils};

    fn assert_close_f32(label: &str, got: &[f32], want: &[f32], tol: f64) -> Result<()> {
        let got = ValidationUtils::widen(got);
        let want = ValidationUtils::widen(want);
        ValidationUtils::assert_close(label, &got, &want, tol, tol)
    }

    fn check_parity(rows: usize, cols: usize, config: &LayerNormConfig) -> Result<()> {
        let case = LayerNormCase::new(rows, cols, 7 + rows as u64);
        let x = ValidationUtils::to_f32(&case.x);
        let scale = ValidationUtils::to_f32(&case.scale);
        let shift = ValidationUtils::to_f32(&case.shift);
        let dy = ValidationUtils::to_f32(&case.dy);

        let host = layer_norm_forward(&x, Some(&scale), Some(&shift), case.layout, 1e-5, config)?;
        let device =
            layer_norm_forward_cuda(&x, Some(&scale), Some(&shift), case.layout, 1e-5, config)?;
        assert_close_f32("y", &device.y, &host.y, 1e-4)?;
        assert_close_f32("rstd", &device.rstd, &host.rstd, 1e-4)?;

        let inputs = BackwardInputs {
            dy: &dy,
            x: &x,
            mean: &host.mean,
            rstd: &host.rstd,
            scale: Some(&scale),
        };
        let host = layer_norm_backward(&inputs, case.layout, GradientMask::ALL, config)?;
        let device = layer_norm_backward_cuda(&inputs, case.layout, GradientMask::ALL, config)?;
        for (label, got, want) in [
            ("dx", &device.dx, &host.dx),
            ("dscale", &device.dscale, &host.dscale),
            ("dshift", &device.dshift, &host.dshift),
        ] {
            let got = got.as_deref().unwrap_or_default();
            let want = want.as_deref().unwrap_or_default();
            assert_close_f32(label, got, want, 1e-3)?;
        }
        Ok(())
    }

    #[test]
    fn test_parity_simple_path() -> Result<()> {
        crate::require_gpu!();
        check_parity(64, 768, &LayerNormConfig::default())
    }

    #[test]
    fn test_parity_tiled_path_ragged_columns() -> Result<()> {
        crate::require_gpu!();
        check_parity(1031, 1000, &LayerNormConfig::default())
    }

    #[test]
    fn test_parity_narrow_tiles() -> Result<()> {
        crate::require_gpu!();
        let config = LayerNormConfig::default()
            .with_tile_width(8)
            .with_tiled_threshold(16);
        check_parity(100, 77, &config)
    }

    #[test]
    fn test_missing_device_is_reported() -> Result<()> {
        if crate::gpu::is_gpu_available() {
            return Ok(());
        }
        let case = LayerNormCase::new(4, 16, 3);
        let x = ValidationUtils::to_f32(&case.x);
        let config = LayerNormConfig::default();
        let err = layer_norm_forward_cuda(&x, None, None, case.layout, 1e-5, &config)
            .err()
            .ok_or_else(|| anyhow::anyhow!("launch without a device succeeded"))?;
        assert!(matches!(err, LayerNormError::DeviceNotAvailable(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_tiled_single_param_grad() -> Result<()> {
        crate::require_gpu!();
        let case = LayerNormCase::new(600, 70, 11);
        let x = ValidationUtils::to_f32(&case.x);
        let dy = ValidationUtils::to_f32(&case.dy);
        let config = LayerNormConfig::default();
        let fwd = layer_norm_forward(&x, None, None, case.layout, 1e-5, &config)?;
        let inputs = BackwardInputs {
            dy: &dy,
            x: &x,
            mean: &fwd.mean,
            rstd: &fwd.rstd,
            scale: None,
        };
        let host = layer_norm_backward(&inputs, case.layout, GradientMask::PARAMS, &config)?;

        for mask in [
            GradientMask {
                dx: false,
                dscale: true,
                dshift: false,
            },
            GradientMask {
                dx: false,
                dscale: false,
                dshift: true,
            },
        ] {
            let device = layer_norm_backward_cuda(&inputs, case.layout, mask, &config)?;
            assert!(device.dx.is_none());
            assert_eq!(device.dscale.is_some(), mask.dscale);
            assert_eq!(device.dshift.is_some(), mask.dshift);
            if let (Some(got), Some(want)) = (&device.dscale, &host.dscale) {
                assert_close_f32("dscale", got, want, 1e-3)?;
            }
            if let (Some(got), Some(want)) = (&device.dshift, &host.dshift) {
                assert_close_f32("dshift", got, want, 1e-3)?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_tensor_facade_on_cuda() -> Result<()> {
        crate::require_gpu!();
        let device = Device::new_cuda(0)?;
        let x_cpu = Tensor::randn(0.0f32, 1.0, (4, 16, 256), &Device::Cpu)?;
        let x_gpu = x_cpu.to_device(&device)?;

        let cpu = LayerNorm::new(&[256], 1e-5, true, DType::F32, &Device::Cpu)?;
        let gpu = LayerNorm::new(&[256], 1e-5, true, DType::F32, &device)?;
        let want: Vec<f32> = cpu.forward(&x_cpu)?.flatten_all()?.to_vec1()?;
        let got: Vec<f32> = gpu.forward(&x_gpu)?.flatten_all()?.to_vec1()?;
        assert_close_f32("facade", &got, &want, 1e-4)
    }
}
