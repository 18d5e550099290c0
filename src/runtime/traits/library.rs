//! Vendor math-library capabilities

use super::driver::RawStream;
use crate::error::Result;

/// Opaque linear-algebra library handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawBlasHandle(pub u64);

/// Opaque convolution/primitives library handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawDnnHandle(pub u64);

/// Linear-algebra library (cuBLAS and friends)
pub trait BlasLibrary: Send + Sync {
    /// Create a handle on `device`
    fn create_handle(&self, device: usize) -> Result<RawBlasHandle>;

    /// Route all work issued through `handle` to `stream`
    fn set_stream(&self, handle: RawBlasHandle, stream: RawStream) -> Result<()>;

    /// Destroy a handle
    fn destroy_handle(&self, handle: RawBlasHandle) -> Result<()>;
}

/// Convolution/primitives library (cuDNN and friends)
///
/// The library may be missing at runtime; contexts query
/// [`DnnLibrary::is_available`] once and skip handle creation when it
/// returns false.
pub trait DnnLibrary: Send + Sync {
    /// Is the library loadable on this machine?
    fn is_available(&self) -> bool;

    /// Create a handle on `device`
    fn create_handle(&self, device: usize) -> Result<RawDnnHandle>;

    /// Route all work issued through `handle` to `stream`
    fn set_stream(&self, handle: RawDnnHandle, stream: RawStream) -> Result<()>;

    /// Destroy a handle
    fn destroy_handle(&self, handle: RawDnnHandle) -> Result<()>;
}

/// Stand-in for builds or machines without a convolution library
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDnn;

impl DnnLibrary for NoDnn {
    fn is_available(&self) -> bool {
        false
    }

    fn create_handle(&self, _device: usize) -> Result<RawDnnHandle> {
        Err(crate::error::Error::dnn(
            "create_handle",
            "no convolution library in this build",
        ))
    }

    fn set_stream(&self, _handle: RawDnnHandle, _stream: RawStream) -> Result<()> {
        Err(crate::error::Error::dnn(
            "set_stream",
            "no convolution library in this build",
        ))
    }

    fn destroy_handle(&self, _handle: RawDnnHandle) -> Result<()> {
        Ok(())
    }
}
