//! Device capabilities consumed by execution contexts
//!
//! Contexts never talk to a vendor API directly. They are built from a small
//! set of capability traits, bundled per backend:
//!
//! # Architecture
//!
//! ```text
//! AcceleratorBackend
//! ├── DeviceDriver  (device selection, metadata, stream lifecycle)
//! ├── BlasLibrary   (linear-algebra handles)
//! └── DnnLibrary    (optional convolution handles)
//!
//! Allocator          (raw memory keyed by Place)
//! ```
//!
//! Implementations:
//!
//! - [`HostAllocator`]: host and pinned-host memory without a driver
//! - [`emulated::EmulatedBackend`]: every capability on host memory, with
//!   deferred stream work and fault injection
//! - `cuda` (feature `cuda`): cudarc driver, cuBLAS, optional cuDNN

pub(crate) mod allocator;
mod backend;
pub mod emulated;
pub mod handles;
pub mod traits;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use allocator::{Allocator, HostAllocator};
pub use backend::AcceleratorBackend;
pub use traits::{
    BlasLibrary, Device, DeviceDriver, DeviceProperties, DnnLibrary, NoDnn, RawBlasHandle,
    RawDnnHandle, RawStream,
};
