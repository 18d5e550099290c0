//! Device driver capability

use crate::error::Result;

/// Opaque driver stream handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawStream(pub u64);

/// Device metadata cached by accelerator contexts
///
/// Versions use the vendor encoding `1000 * major + 10 * minor`
/// (e.g. 12040 for 12.4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Compute capability as `10 * major + minor` (e.g. 86 for sm_86)
    pub compute_capability: u32,
    /// Number of streaming multiprocessors
    pub multiprocessor_count: u32,
    /// Resident thread limit per multiprocessor
    pub max_threads_per_multiprocessor: u32,
    /// Installed driver version
    pub driver_version: i32,
    /// Runtime version the backend was built against
    pub runtime_version: i32,
}

impl DeviceProperties {
    /// Total resident thread capacity of the device
    pub fn max_physical_thread_count(&self) -> u64 {
        self.multiprocessor_count as u64 * self.max_threads_per_multiprocessor as u64
    }

    /// Driver version as `major.minor`
    pub fn driver_version_string(&self) -> String {
        format_version(self.driver_version)
    }

    /// Runtime version as `major.minor`
    pub fn runtime_version_string(&self) -> String {
        format_version(self.runtime_version)
    }
}

fn format_version(version: i32) -> String {
    format!("{}.{}", version / 1000, (version % 100) / 10)
}

/// Device driver capability
///
/// Streams are FIFO work queues owned by the driver; enqueue is the caller's
/// business, this trait only covers the lifecycle and ordering calls that
/// execution contexts need. Implementations must be callable from any
/// thread.
pub trait DeviceDriver: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Number of devices visible to the driver
    fn device_count(&self) -> Result<usize>;

    /// Make `device` the active device of the calling thread
    fn set_device(&self, device: usize) -> Result<()>;

    /// Query device metadata
    fn properties(&self, device: usize) -> Result<DeviceProperties>;

    /// Create a new stream on `device`
    fn create_stream(&self, device: usize) -> Result<RawStream>;

    /// Block until all work enqueued on `stream` has completed
    ///
    /// Asynchronous faults raised by that work surface here.
    fn synchronize(&self, stream: RawStream) -> Result<()>;

    /// Report any sticky error recorded on `device`
    fn last_error(&self, device: usize) -> Result<()>;

    /// Destroy a stream created by [`DeviceDriver::create_stream`]
    fn destroy_stream(&self, stream: RawStream) -> Result<()>;

    /// Enqueue a byte fill of `size_bytes` at `ptr` on `stream`
    fn memset_async(&self, stream: RawStream, ptr: u64, value: u8, size_bytes: usize)
    -> Result<()>;
}
