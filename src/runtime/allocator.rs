//! Memory allocator trait and host implementation
//!
//! The `Allocator` is the raw memory capability every context draws from.
//! Requests are keyed by [`Place`] so one allocator can serve host, pinned
//! and device memory.

use crate::error::{Error, Result};
use crate::place::Place;
use std::alloc::{Layout as AllocLayout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment for host allocations (AVX-512 friendly)
pub(crate) const HOST_ALIGN: usize = 64;

/// Memory allocator for execution contexts
///
/// Returned addresses are opaque `u64` values that are only meaningful on
/// the place they were allocated for. Address `0` is the null allocation
/// returned for zero-byte requests.
pub trait Allocator: Send + Sync {
    /// Allocate `size_bytes` on `place`
    ///
    /// Returns `Err(OutOfMemory)` if the request cannot be satisfied.
    fn allocate(&self, place: Place, size_bytes: usize) -> Result<u64>;

    /// Release memory previously returned by `allocate` for the same place
    fn deallocate(&self, place: Place, ptr: u64, size_bytes: usize);

    /// Get the total allocated bytes
    fn allocated_bytes(&self) -> usize {
        0 // Default: tracking not supported
    }
}

/// Allocate zeroed, aligned host memory.
pub(crate) fn host_alloc(size_bytes: usize) -> Result<u64> {
    if size_bytes == 0 {
        return Ok(0);
    }

    let layout = AllocLayout::from_size_align(size_bytes, HOST_ALIGN)
        .map_err(|_| Error::OutOfMemory { size: size_bytes })?;

    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(Error::OutOfMemory { size: size_bytes });
    }

    Ok(ptr as u64)
}

/// Release memory returned by [`host_alloc`] with the same size.
pub(crate) fn host_free(ptr: u64, size_bytes: usize) {
    if ptr == 0 || size_bytes == 0 {
        return;
    }

    let Ok(layout) = AllocLayout::from_size_align(size_bytes, HOST_ALIGN) else {
        return;
    };

    // SAFETY: ptr was produced by host_alloc with this exact layout.
    unsafe {
        dealloc(ptr as *mut u8, layout);
    }
}

/// Host allocator backed by the system allocator
///
/// Serves [`Place::Host`] and [`Place::HostPinned`]. Without a driver the
/// pinned place is plain pageable memory, which is enough for contexts that
/// only stage data. Accelerator places are rejected.
#[derive(Debug, Default)]
pub struct HostAllocator {
    allocated: AtomicUsize,
}

impl HostAllocator {
    /// Create a new host allocator
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, place: Place, size_bytes: usize) -> Result<u64> {
        if place.is_accelerator() {
            return Err(Error::unsupported_place(
                place,
                "host allocator cannot allocate device memory",
            ));
        }

        let ptr = host_alloc(size_bytes)?;
        self.allocated.fetch_add(size_bytes, Ordering::Relaxed);
        Ok(ptr)
    }

    fn deallocate(&self, place: Place, ptr: u64, size_bytes: usize) {
        if place.is_accelerator() || ptr == 0 {
            return;
        }

        host_free(ptr, size_bytes);
        self.allocated.fetch_sub(size_bytes, Ordering::Relaxed);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
