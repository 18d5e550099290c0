//! CUDA driver capability using cudarc
//!
//! # Thread Safety
//!
//! `CudaDriver` is `Send + Sync`. One `CudaContext` is kept per device and
//! bound to the calling thread by `set_device`. Streams are owned by the
//! driver and addressed by their raw `CUstream` value.

use cudarc::driver::safe::{CudaContext, CudaStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::traits::{DeviceDriver, DeviceProperties, RawStream};

/// Check if the CUDA context on the current thread is valid.
///
/// # Safety
///
/// This function calls CUDA driver API directly. It is safe to call at any time
/// but the result is only valid for the current thread's context state.
#[inline]
pub(super) unsafe fn is_cuda_context_valid() -> bool {
    let mut ctx: cudarc::driver::sys::CUcontext = std::ptr::null_mut();
    // SAFETY: cuCtxGetCurrent is safe to call at any time and writes to the provided pointer.
    let result = unsafe { cudarc::driver::sys::cuCtxGetCurrent(&mut ctx) };
    result == cudarc::driver::sys::CUresult::CUDA_SUCCESS && !ctx.is_null()
}

/// Log a CUDA memory operation failure.
#[cold]
#[inline(never)]
pub(super) fn log_cuda_memory_error(operation: &str, ptr: u64, result: cudarc::driver::sys::CUresult) {
    tracing::warn!(
        target: "devctx::cuda",
        "{} failed for ptr 0x{:x}: {:?}",
        operation,
        ptr,
        result
    );
}

/// CUDA driver backend
pub struct CudaDriver {
    /// Device index -> primary context
    contexts: Mutex<HashMap<usize, Arc<CudaContext>>>,
    /// Raw stream -> (device, owned stream)
    streams: Mutex<HashMap<RawStream, (usize, Arc<CudaStream>)>>,
}

impl CudaDriver {
    /// Create a driver with no contexts yet
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the context for `device`
    pub fn context(&self, device: usize) -> Result<Arc<CudaContext>> {
        let mut contexts = self.contexts.lock();
        if let Some(context) = contexts.get(&device) {
            return Ok(context.clone());
        }

        let context = CudaContext::new(device).map_err(|e| {
            Error::driver(
                "create_context",
                device,
                format!("Failed to create CUDA context: {:?}", e),
            )
        })?;
        contexts.insert(device, context.clone());
        Ok(context)
    }

    /// Owned stream behind a raw handle, for kernel launchers
    pub fn stream(&self, stream: RawStream) -> Option<Arc<CudaStream>> {
        self.streams.lock().get(&stream).map(|(_, s)| s.clone())
    }

    fn lookup(&self, stream: RawStream, op: &'static str) -> Result<(usize, Arc<CudaStream>)> {
        self.streams
            .lock()
            .get(&stream)
            .cloned()
            .ok_or_else(|| Error::driver(op, 0, format!("unknown stream {:#x}", stream.0)))
    }

    fn attribute(
        device: usize,
        attribute: cudarc::driver::sys::CUdevice_attribute,
        name: &str,
    ) -> Result<u32> {
        let handle = cudarc::driver::result::device::get(device as i32).map_err(|e| {
            Error::driver("properties", device, format!("Failed to get CUDA device: {:?}", e))
        })?;

        // SAFETY: handle is a valid device ordinal returned by the driver.
        let value = unsafe { cudarc::driver::result::device::get_attribute(handle, attribute) }
            .map_err(|e| {
                Error::driver("properties", device, format!("Failed to get {}: {:?}", name, e))
            })?;
        Ok(value as u32)
    }
}

impl Default for CudaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for CudaDriver {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        cudarc::driver::result::init()?;
        let count = cudarc::driver::result::device::get_count()?;
        Ok(count as usize)
    }

    fn set_device(&self, device: usize) -> Result<()> {
        let count = self.device_count()?;
        if device >= count {
            return Err(Error::InvalidDevice { device, count });
        }

        self.context(device)?.bind_to_thread().map_err(|e| {
            Error::driver(
                "set_device",
                device,
                format!("Failed to bind CUDA context to thread: {:?}", e),
            )
        })
    }

    fn properties(&self, device: usize) -> Result<DeviceProperties> {
        use cudarc::driver::sys::CUdevice_attribute as Attr;

        let major = Self::attribute(
            device,
            Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
            "compute capability major",
        )?;
        let minor = Self::attribute(
            device,
            Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
            "compute capability minor",
        )?;
        let multiprocessor_count = Self::attribute(
            device,
            Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
            "multiprocessor count",
        )?;
        let max_threads_per_multiprocessor = Self::attribute(
            device,
            Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR,
            "max threads per multiprocessor",
        )?;

        let mut driver_version: i32 = 0;
        // SAFETY: cuDriverGetVersion only writes to the provided pointer.
        let result = unsafe { cudarc::driver::sys::cuDriverGetVersion(&mut driver_version) };
        if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
            return Err(Error::driver(
                "properties",
                device,
                format!("Failed to get driver version: {:?}", result),
            ));
        }

        Ok(DeviceProperties {
            compute_capability: major * 10 + minor,
            multiprocessor_count,
            max_threads_per_multiprocessor,
            driver_version,
            // cudarc binds the driver API only, so the driver's CUDA version
            // is the runtime version kernels are launched against.
            runtime_version: driver_version,
        })
    }

    fn create_stream(&self, device: usize) -> Result<RawStream> {
        let stream = self.context(device)?.new_stream().map_err(|e| {
            Error::driver(
                "create_stream",
                device,
                format!("Failed to create CUDA stream: {:?}", e),
            )
        })?;

        let raw = RawStream(stream.cu_stream() as u64);
        self.streams.lock().insert(raw, (device, stream));
        Ok(raw)
    }

    fn synchronize(&self, stream: RawStream) -> Result<()> {
        let (device, stream) = self.lookup(stream, "synchronize")?;
        stream.synchronize().map_err(|e| Error::AsyncFault {
            device,
            reason: format!("{:?}", e),
        })
    }

    fn last_error(&self, _device: usize) -> Result<()> {
        // The driver API has no separate error slot: sticky faults are
        // returned by the synchronize call that precedes this check.
        Ok(())
    }

    fn destroy_stream(&self, stream: RawStream) -> Result<()> {
        // Dropping the last Arc destroys the CUstream.
        self.streams
            .lock()
            .remove(&stream)
            .map(|_| ())
            .ok_or_else(|| {
                Error::driver("destroy_stream", 0, format!("unknown stream {:#x}", stream.0))
            })
    }

    fn memset_async(
        &self,
        stream: RawStream,
        ptr: u64,
        value: u8,
        size_bytes: usize,
    ) -> Result<()> {
        let (device, stream) = self.lookup(stream, "memset_async")?;

        // SAFETY: ptr is device memory owned by the caller and the stream is live.
        let result = unsafe {
            cudarc::driver::sys::cuMemsetD8Async(ptr, value, size_bytes, stream.cu_stream())
        };
        if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
            return Err(Error::driver(
                "memset_async",
                device,
                format!("{} bytes at 0x{:x}: {:?}", size_bytes, ptr, result),
            ));
        }
        Ok(())
    }
}
