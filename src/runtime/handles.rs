//! Ownership wrappers for driver and library handles
//!
//! Each wrapper owns one raw handle and knows how to destroy it. Destruction
//! is explicit (`destroy`) so accelerator teardown controls the order. If a
//! wrapper is dropped while still live, which only happens when context
//! construction fails partway, it releases its handle itself and logs any
//! failure.

use super::traits::{
    BlasLibrary, DeviceDriver, DnnLibrary, RawBlasHandle, RawDnnHandle, RawStream,
};
use crate::error::Result;
use std::sync::Arc;

// ============================================================================
// Stream
// ============================================================================

/// Exclusively owned device stream
pub struct Stream {
    raw: RawStream,
    device: usize,
    driver: Arc<dyn DeviceDriver>,
    live: bool,
}

impl Stream {
    /// Create a stream on `device`
    pub fn create(driver: &Arc<dyn DeviceDriver>, device: usize) -> Result<Self> {
        let raw = driver.create_stream(device)?;
        Ok(Self {
            raw,
            device,
            driver: Arc::clone(driver),
            live: true,
        })
    }

    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawStream {
        self.raw
    }

    /// Device the stream belongs to
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Block until all enqueued work completed
    pub fn synchronize(&self) -> Result<()> {
        self.driver.synchronize(self.raw)
    }

    /// Destroy the stream. Idempotent.
    ///
    /// Callers must have synchronized first; destroying a stream with work in
    /// flight is undefined on real drivers.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        self.driver.destroy_stream(self.raw)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        if let Err(e) = self.driver.synchronize(self.raw) {
            tracing::error!(device = self.device, error = %e, "stream drain failed before destroy");
        }
        if let Err(e) = self.destroy() {
            tracing::error!(device = self.device, error = %e, "stream destroy failed");
        }
    }
}

// ============================================================================
// BlasHandle
// ============================================================================

/// Linear-algebra handle bound to one stream
pub struct BlasHandle {
    raw: RawBlasHandle,
    blas: Arc<dyn BlasLibrary>,
    live: bool,
}

impl BlasHandle {
    /// Create a handle on `device`
    pub fn create(blas: &Arc<dyn BlasLibrary>, device: usize) -> Result<Self> {
        let raw = blas.create_handle(device)?;
        Ok(Self {
            raw,
            blas: Arc::clone(blas),
            live: true,
        })
    }

    /// Route the handle's work to `stream`
    pub fn bind(&self, stream: &Stream) -> Result<()> {
        self.blas.set_stream(self.raw, stream.raw())
    }

    /// Raw library handle
    #[inline]
    pub fn raw(&self) -> RawBlasHandle {
        self.raw
    }

    /// Destroy the handle. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        self.blas.destroy_handle(self.raw)
    }
}

impl Drop for BlasHandle {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!(error = %e, "BLAS handle destroy failed");
        }
    }
}

// ============================================================================
// DnnHandle
// ============================================================================

/// Convolution/primitives handle bound to one stream
pub struct DnnHandle {
    raw: RawDnnHandle,
    dnn: Arc<dyn DnnLibrary>,
    live: bool,
}

impl DnnHandle {
    /// Create a handle on `device`
    pub fn create(dnn: &Arc<dyn DnnLibrary>, device: usize) -> Result<Self> {
        let raw = dnn.create_handle(device)?;
        Ok(Self {
            raw,
            dnn: Arc::clone(dnn),
            live: true,
        })
    }

    /// Route the handle's work to `stream`
    pub fn bind(&self, stream: &Stream) -> Result<()> {
        self.dnn.set_stream(self.raw, stream.raw())
    }

    /// Raw library handle
    #[inline]
    pub fn raw(&self) -> RawDnnHandle {
        self.raw
    }

    /// Destroy the handle. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        self.dnn.destroy_handle(self.raw)
    }
}

impl Drop for DnnHandle {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!(error = %e, "DNN handle destroy failed");
        }
    }
}
