//! cuBLAS and cuDNN handle lifecycles

use std::sync::Arc;

use super::driver::CudaDriver;
use crate::error::{Error, Result};
use crate::runtime::traits::{BlasLibrary, DeviceDriver, RawBlasHandle, RawStream};

/// cuBLAS handle factory
pub struct CublasLibrary {
    driver: Arc<CudaDriver>,
}

impl CublasLibrary {
    /// Create handles in `driver`'s contexts
    pub fn new(driver: Arc<CudaDriver>) -> Self {
        Self { driver }
    }
}

#[inline]
fn blas_handle(handle: RawBlasHandle) -> cudarc::cublas::sys::cublasHandle_t {
    handle.0 as usize as cudarc::cublas::sys::cublasHandle_t
}

impl BlasLibrary for CublasLibrary {
    fn create_handle(&self, device: usize) -> Result<RawBlasHandle> {
        self.driver.set_device(device)?;
        let handle = cudarc::cublas::result::create_handle()
            .map_err(|e| Error::blas("create_handle", format!("{:?}", e)))?;
        Ok(RawBlasHandle(handle as u64))
    }

    fn set_stream(&self, handle: RawBlasHandle, stream: RawStream) -> Result<()> {
        // SAFETY: handle was created by create_handle and stream is a live CUstream.
        unsafe {
            cudarc::cublas::result::set_stream(
                blas_handle(handle),
                stream.0 as usize as cudarc::cublas::sys::cudaStream_t,
            )
        }
        .map_err(|e| Error::blas("set_stream", format!("{:?}", e)))
    }

    fn destroy_handle(&self, handle: RawBlasHandle) -> Result<()> {
        // SAFETY: handle was created by create_handle and is destroyed once.
        unsafe { cudarc::cublas::result::destroy_handle(blas_handle(handle)) }
            .map_err(|e| Error::blas("destroy_handle", format!("{:?}", e)))
    }
}

#[cfg(feature = "cudnn")]
pub use cudnn::CudnnLibrary;

#[cfg(feature = "cudnn")]
mod cudnn {
    use std::sync::Arc;

    use super::CudaDriver;
    use crate::error::{Error, Result};
    use crate::runtime::traits::{DeviceDriver, DnnLibrary, RawDnnHandle, RawStream};

    /// cuDNN handle factory
    ///
    /// cuDNN is loaded dynamically; when the shared library is missing the
    /// availability probe fails and contexts run without a DNN handle.
    pub struct CudnnLibrary {
        driver: Arc<CudaDriver>,
        available: bool,
    }

    impl CudnnLibrary {
        /// Probe for cuDNN and create handles in `driver`'s contexts
        pub fn new(driver: Arc<CudaDriver>) -> Self {
            let available = std::panic::catch_unwind(|| {
                // SAFETY: cudnnGetVersion has no preconditions.
                unsafe { cudarc::cudnn::sys::cudnnGetVersion() }
            })
            .is_ok_and(|version| version > 0);

            Self { driver, available }
        }
    }

    #[inline]
    fn dnn_handle(handle: RawDnnHandle) -> cudarc::cudnn::sys::cudnnHandle_t {
        handle.0 as usize as cudarc::cudnn::sys::cudnnHandle_t
    }

    impl DnnLibrary for CudnnLibrary {
        fn is_available(&self) -> bool {
            self.available
        }

        fn create_handle(&self, device: usize) -> Result<RawDnnHandle> {
            if !self.available {
                return Err(Error::dnn("create_handle", "cuDNN is not loadable"));
            }
            self.driver.set_device(device)?;
            let handle = cudarc::cudnn::result::create_handle()
                .map_err(|e| Error::dnn("create_handle", format!("{:?}", e)))?;
            Ok(RawDnnHandle(handle as u64))
        }

        fn set_stream(&self, handle: RawDnnHandle, stream: RawStream) -> Result<()> {
            // SAFETY: handle was created by create_handle and stream is a live CUstream.
            unsafe {
                cudarc::cudnn::result::set_stream(
                    dnn_handle(handle),
                    stream.0 as usize as cudarc::cudnn::sys::cudaStream_t,
                )
            }
            .map_err(|e| Error::dnn("set_stream", format!("{:?}", e)))
        }

        fn destroy_handle(&self, handle: RawDnnHandle) -> Result<()> {
            // SAFETY: handle was created by create_handle and is destroyed once.
            unsafe { cudarc::cudnn::result::destroy_handle(dnn_handle(handle)) }
                .map_err(|e| Error::dnn("destroy_handle", format!("{:?}", e)))
        }
    }
}
