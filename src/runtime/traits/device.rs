//! Trait for elementwise device adapters

use crate::error::Result;
use crate::place::Place;

/// Device abstraction handed to elementwise/tensor kernels
///
/// Every execution context owns exactly one adapter. Host contexts use a
/// non-streamed adapter; accelerator contexts use one bound to their stream.
pub trait Device: Send + Sync {
    /// Place this adapter allocates on and dispatches to
    fn place(&self) -> Place;

    /// Unique identifier for this device
    fn id(&self) -> usize {
        self.place().device_index().unwrap_or(0)
    }

    /// Human-readable name
    fn name(&self) -> String {
        self.place().to_string()
    }

    /// Is this adapter ordered by a device stream?
    fn is_streamed(&self) -> bool {
        false
    }

    /// Allocate kernel temporaries on this adapter's place
    fn allocate(&self, size_bytes: usize) -> Result<u64>;

    /// Free memory obtained from [`Device::allocate`]
    fn deallocate(&self, ptr: u64, size_bytes: usize);

    /// Synchronize: wait for all pending operations to complete
    fn synchronize(&self) -> Result<()>;
}
