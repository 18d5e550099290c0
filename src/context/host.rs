//! Host and pinned-host execution contexts

use crate::error::Result;
use crate::place::Place;
use crate::runtime::Allocator;
use crate::runtime::traits::Device;
use std::fmt;
use std::sync::Arc;

/// Non-streamed device adapter for host places
///
/// Work dispatched through it runs synchronously on the calling thread, so
/// [`Device::synchronize`] has nothing to wait for.
pub struct HostDevice {
    place: Place,
    allocator: Arc<dyn Allocator>,
}

impl HostDevice {
    /// Create an adapter allocating on `place`
    pub fn new(place: Place, allocator: Arc<dyn Allocator>) -> Self {
        Self { place, allocator }
    }
}

impl Device for HostDevice {
    fn place(&self) -> Place {
        self.place
    }

    fn allocate(&self, size_bytes: usize) -> Result<u64> {
        self.allocator.allocate(self.place, size_bytes)
    }

    fn deallocate(&self, ptr: u64, size_bytes: usize) {
        self.allocator.deallocate(self.place, ptr, size_bytes)
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// Context for [`Place::Host`] or [`Place::HostPinned`]
///
/// Holds nothing but its place and the adapter built at construction.
pub struct HostContext {
    device: HostDevice,
}

impl HostContext {
    /// Create a context for a host place
    pub fn new(place: Place, allocator: Arc<dyn Allocator>) -> Self {
        debug_assert!(!place.is_accelerator(), "host context for {place}");
        Self {
            device: HostDevice::new(place, allocator),
        }
    }

    /// Place this context serves
    #[inline]
    pub fn place(&self) -> Place {
        self.device.place
    }

    /// Host device adapter
    #[inline]
    pub fn device(&self) -> &HostDevice {
        &self.device
    }

    /// Host work is synchronous; always succeeds.
    pub fn wait(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("place", &self.place())
            .finish()
    }
}
