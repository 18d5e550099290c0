//! Stream-bound device adapter for elementwise kernels

use super::accelerator::ContextState;
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::Allocator;
use crate::runtime::traits::{Device, DeviceDriver, RawStream};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bytes of kernel scratch space behind [`StreamDevice::scratchpad`]
pub const SCRATCH_SIZE: usize = 1024;

/// Size of the reduction semaphore placed right after the scratch space
const SEMAPHORE_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Default)]
struct Scratch {
    ptr: u64,
    semaphore_ready: bool,
    released: bool,
}

/// Device adapter that orders its work on one accelerator stream
///
/// The stream is borrowed from the owning context and never destroyed here.
/// Once the context releases the adapter, every call that would touch the
/// stream or the scratch region fails with [`Error::ContextNotReady`].
pub struct StreamDevice {
    place: Place,
    stream: RawStream,
    driver: Arc<dyn DeviceDriver>,
    allocator: Arc<dyn Allocator>,
    scratch: Mutex<Scratch>,
}

impl StreamDevice {
    pub(crate) fn new(
        place: Place,
        stream: RawStream,
        driver: Arc<dyn DeviceDriver>,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            place,
            stream,
            driver,
            allocator,
            scratch: Mutex::new(Scratch::default()),
        }
    }

    /// Stream kernels launched through this adapter are queued on
    #[inline]
    pub fn stream(&self) -> RawStream {
        self.stream
    }

    /// Fixed-size scratch region, allocated on first use and then reused
    pub fn scratchpad(&self) -> Result<u64> {
        let mut scratch = self.scratch.lock();
        self.ensure_scratch(&mut scratch)
    }

    /// Zero-initialized `u32` semaphore at the end of the scratch region
    ///
    /// The zero fill is queued on the stream the first time, so kernels
    /// launched afterwards on the same stream observe it.
    pub fn semaphore(&self) -> Result<u64> {
        let mut scratch = self.scratch.lock();
        let base = self.ensure_scratch(&mut scratch)?;
        let semaphore = base + SCRATCH_SIZE as u64;
        if !scratch.semaphore_ready {
            self.driver
                .memset_async(self.stream, semaphore, 0, SEMAPHORE_SIZE)?;
            scratch.semaphore_ready = true;
        }
        Ok(semaphore)
    }

    fn ensure_live(&self, scratch: &Scratch) -> Result<()> {
        if scratch.released {
            return Err(Error::ContextNotReady {
                place: self.place,
                state: ContextState::Destroyed.as_str(),
            });
        }
        Ok(())
    }

    fn ensure_scratch(&self, scratch: &mut Scratch) -> Result<u64> {
        self.ensure_live(scratch)?;
        if scratch.ptr == 0 {
            scratch.ptr = self
                .allocator
                .allocate(self.place, SCRATCH_SIZE + SEMAPHORE_SIZE)?;
        }
        Ok(scratch.ptr)
    }

    /// Free the scratch region and refuse further use. The stream must
    /// already be drained.
    pub(crate) fn release(&self) {
        let mut scratch = self.scratch.lock();
        if scratch.ptr != 0 {
            self.allocator
                .deallocate(self.place, scratch.ptr, SCRATCH_SIZE + SEMAPHORE_SIZE);
        }
        *scratch = Scratch {
            released: true,
            ..Scratch::default()
        };
    }
}

impl Device for StreamDevice {
    fn place(&self) -> Place {
        self.place
    }

    fn is_streamed(&self) -> bool {
        true
    }

    fn allocate(&self, size_bytes: usize) -> Result<u64> {
        self.allocator.allocate(self.place, size_bytes)
    }

    fn deallocate(&self, ptr: u64, size_bytes: usize) {
        self.allocator.deallocate(self.place, ptr, size_bytes)
    }

    fn synchronize(&self) -> Result<()> {
        self.ensure_live(&self.scratch.lock())?;
        self.driver.synchronize(self.stream)
    }
}
