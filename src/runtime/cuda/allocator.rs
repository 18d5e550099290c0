//! CUDA allocator for host, pinned host and device memory

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::driver::{CudaDriver, is_cuda_context_valid, log_cuda_memory_error};
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::Allocator;
use crate::runtime::allocator::{host_alloc, host_free};
use crate::runtime::traits::DeviceDriver;

/// Allocator that routes each place to the matching CUDA allocation call.
///
/// - `Host`: aligned system allocation
/// - `HostPinned`: `cuMemAllocHost` (page-locked, in device 0's context)
/// - `Accelerator(i)`: `cuMemAlloc` in device i's context
///
/// Device allocations are synchronous on purpose: workspace buffers outlive
/// any single stream operation.
pub struct CudaAllocator {
    driver: Arc<CudaDriver>,
    allocated: AtomicUsize,
}

impl CudaAllocator {
    /// Create an allocator sharing `driver`'s contexts
    pub fn new(driver: Arc<CudaDriver>) -> Self {
        Self {
            driver,
            allocated: AtomicUsize::new(0),
        }
    }
}

impl Allocator for CudaAllocator {
    fn allocate(&self, place: Place, size_bytes: usize) -> Result<u64> {
        if size_bytes == 0 {
            return Ok(0);
        }

        let ptr = match place {
            Place::Host => host_alloc(size_bytes)?,
            Place::HostPinned => {
                self.driver.set_device(0)?;
                let mut ptr: *mut c_void = std::ptr::null_mut();
                // SAFETY: a context is bound and ptr is a valid out-pointer.
                let result = unsafe { cudarc::driver::sys::cuMemAllocHost_v2(&mut ptr, size_bytes) };
                if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS || ptr.is_null() {
                    return Err(Error::OutOfMemory { size: size_bytes });
                }
                ptr as u64
            }
            Place::Accelerator(device) => {
                self.driver.set_device(device)?;
                let mut ptr: u64 = 0;
                // SAFETY: device's context is bound and ptr is a valid out-pointer.
                let result = unsafe { cudarc::driver::sys::cuMemAlloc_v2(&mut ptr, size_bytes) };
                if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                    return Err(Error::OutOfMemory { size: size_bytes });
                }
                ptr
            }
        };

        self.allocated.fetch_add(size_bytes, Ordering::Relaxed);
        Ok(ptr)
    }

    fn deallocate(&self, place: Place, ptr: u64, size_bytes: usize) {
        if ptr == 0 {
            return;
        }

        match place {
            Place::Host => host_free(ptr, size_bytes),
            Place::HostPinned => {
                // SAFETY: ptr came from cuMemAllocHost.
                let result = unsafe { cudarc::driver::sys::cuMemFreeHost(ptr as *mut c_void) };
                if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                    log_cuda_memory_error("cuMemFreeHost", ptr, result);
                }
            }
            Place::Accelerator(device) => {
                if self.driver.set_device(device).is_err() {
                    return;
                }
                unsafe {
                    // Context is gone - memory will be reclaimed by driver on context destruction
                    if !is_cuda_context_valid() {
                        return;
                    }
                    let result = cudarc::driver::sys::cuMemFree_v2(ptr);
                    if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS
                        && result != cudarc::driver::sys::CUresult::CUDA_ERROR_ILLEGAL_ADDRESS
                    {
                        log_cuda_memory_error("cuMemFree", ptr, result);
                    }
                }
            }
        }

        self.allocated.fetch_sub(size_bytes, Ordering::Relaxed);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
