//! Capability traits for the external collaborators of execution contexts

pub mod device;
pub mod driver;
pub mod library;

pub use device::Device;
pub use driver::{DeviceDriver, DeviceProperties, RawStream};
pub use library::{BlasLibrary, DnnLibrary, NoDnn, RawBlasHandle, RawDnnHandle};
