//! CUDA accelerator backend
//!
//! This module provides the accelerator capabilities via NVIDIA CUDA using cudarc.
//!
//! # Features
//!
//! - `CudaDriver` - Device selection, metadata, stream lifecycle
//! - `CublasLibrary` - cuBLAS handle lifecycle
//! - `CudnnLibrary` - cuDNN handle lifecycle (`cudnn` feature)
//! - `CudaAllocator` - Host, pinned host and device memory
//!
//! All four share one process-wide `CudaDriver` so that contexts, streams and
//! allocations agree on which CUDA context belongs to which device.

mod allocator;
mod driver;
mod library;

pub use allocator::CudaAllocator;
pub use driver::CudaDriver;
#[cfg(feature = "cudnn")]
pub use library::CudnnLibrary;
pub use library::CublasLibrary;

use crate::runtime::{AcceleratorBackend, Allocator};
use crate::runtime::traits::DeviceDriver;
use std::sync::{Arc, OnceLock};

/// Process-wide driver: one CUDA context per device.
static DRIVER: OnceLock<Arc<CudaDriver>> = OnceLock::new();

/// Get the shared CUDA driver
pub fn shared_driver() -> Arc<CudaDriver> {
    DRIVER.get_or_init(|| Arc::new(CudaDriver::new())).clone()
}

/// Accelerator capabilities backed by CUDA
pub fn cuda_backend() -> AcceleratorBackend {
    let driver = shared_driver();

    #[cfg(feature = "cudnn")]
    let dnn: Arc<dyn crate::runtime::traits::DnnLibrary> =
        Arc::new(CudnnLibrary::new(driver.clone()));
    #[cfg(not(feature = "cudnn"))]
    let dnn: Arc<dyn crate::runtime::traits::DnnLibrary> = Arc::new(crate::runtime::traits::NoDnn);

    AcceleratorBackend::new(driver.clone(), Arc::new(CublasLibrary::new(driver)), dnn)
}

/// Allocator backed by CUDA
pub fn cuda_allocator() -> Arc<dyn Allocator> {
    Arc::new(CudaAllocator::new(shared_driver()))
}

/// Check if CUDA is available on this system
pub fn is_cuda_available() -> bool {
    std::panic::catch_unwind(|| shared_driver().device_count())
        .ok()
        .and_then(|count| count.ok())
        .is_some_and(|count| count > 0)
}
