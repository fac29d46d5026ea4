//! GPU-specific tests for layernorm-rs.
//!
//! These tests compare the `CubeCL` kernels against the host passes. They
//! are compiled only with the `cuda` feature and return early when no
//! CUDA device is usable.
//!
//! ## Running GPU Tests
//!
//! ```bash
//! cargo test --features cuda --test integration
//! ```

pub mod layer_norm;

/// Check if a CUDA GPU is available for testing.
#[cfg(feature = "cuda")]
pub fn is_gpu_available() -> bool {
    use candle_core::Device;

    match Device::new_cuda(0) {
        Ok(device) => match candle_core::Tensor::ones((2, 2), candle_core::DType::F32, &device)
            .and_then(|t| t.sum_all())
        {
            Ok(_) => {
                tracing::info!("GPU detected and functional: {:?}", device);
                true
            }
            Err(e) => {
                tracing::warn!("GPU detected but tensor operations failed: {}", e);
                false
            }
        },
        Err(e) => {
            tracing::warn!("No CUDA GPU available: {}", e);
            false
        }
    }
}

/// Fallback when the `cuda` feature is off.
#[cfg(not(feature = "cuda"))]
pub fn is_gpu_available() -> bool {
    false
}

/// Return `Ok(())` from the calling test when no GPU is usable.
#[macro_export]
macro_rules! require_gpu {
    () => {
        if !$crate::gpu::is_gpu_available() {
            eprintln!("SKIP: Test requires CUDA GPU - use 'cargo test --features cuda'");
            return Ok(());
        }
    };
}
