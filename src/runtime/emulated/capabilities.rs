//! Capability trait implementations for the emulated backend

use super::{EmulatedBackend, Event, FaultPoint, HandleState, StreamState};
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::Allocator;
use crate::runtime::allocator::{host_alloc, host_free};
use crate::runtime::traits::{
    BlasLibrary, DeviceDriver, DeviceProperties, DnnLibrary, RawBlasHandle, RawDnnHandle,
    RawStream,
};
use parking_lot::Mutex;

impl EmulatedBackend {
    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.device_count {
            return Err(Error::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

impl DeviceDriver for EmulatedBackend {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn set_device(&self, device: usize) -> Result<()> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        state.events.push(Event::SetDevice(device));
        if state.take_fault(FaultPoint::SetDevice) {
            return Err(Error::driver("set_device", device, "injected failure"));
        }
        state.active_device = Some(device);
        Ok(())
    }

    fn properties(&self, device: usize) -> Result<DeviceProperties> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        state.events.push(Event::QueryProperties(device));
        if state.take_fault(FaultPoint::Properties) {
            return Err(Error::driver("properties", device, "injected failure"));
        }
        Ok(self.properties)
    }

    fn create_stream(&self, device: usize) -> Result<RawStream> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::CreateStream) {
            return Err(Error::driver("create_stream", device, "injected failure"));
        }

        let stream = RawStream(state.next_handle());
        state.streams.insert(
            stream,
            StreamState {
                device,
                ..Default::default()
            },
        );
        state.events.push(Event::CreateStream { device, stream });
        Ok(stream)
    }

    fn synchronize(&self, stream: RawStream) -> Result<()> {
        let exec = {
            let state = self.state.lock();
            state.streams.get(&stream).map(|s| s.exec.clone())
        };
        // Held for the whole drain so concurrent synchronizers of this
        // stream cannot interleave its work or return before it finished.
        let _exec = exec.as_deref().map(Mutex::lock);

        let device = {
            let mut state = self.state.lock();
            state.events.push(Event::Synchronize(stream));
            let injected = state.take_fault(FaultPoint::Synchronize);
            let stream_state = state.live_stream(stream, "synchronize")?;
            if injected {
                return Err(Error::driver(
                    "synchronize",
                    stream_state.device,
                    "injected failure",
                ));
            }
            stream_state.device
        };

        loop {
            let work = {
                let mut state = self.state.lock();
                state
                    .streams
                    .get_mut(&stream)
                    .and_then(|s| s.pending.pop_front())
            };
            let Some(work) = work else {
                break;
            };

            work();

            if let Some(stream_state) = self.state.lock().streams.get_mut(&stream) {
                stream_state.completed += 1;
            }
        }

        let mut state = self.state.lock();
        match state.streams.get_mut(&stream).and_then(|s| s.fault.take()) {
            Some(reason) => Err(Error::AsyncFault { device, reason }),
            None => Ok(()),
        }
    }

    fn last_error(&self, device: usize) -> Result<()> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        state.events.push(Event::CheckLastError(device));
        match state.sticky.remove(&device) {
            Some(reason) => Err(Error::AsyncFault { device, reason }),
            None => Ok(()),
        }
    }

    fn destroy_stream(&self, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::DestroyStream(stream));
        if state.take_fault(FaultPoint::DestroyStream) {
            return Err(Error::driver("destroy_stream", 0, "injected failure"));
        }

        let bound = state.blas.values().any(|h| h.stream == Some(stream))
            || state.dnn.values().any(|h| h.stream == Some(stream));

        let stream_state = state.live_stream(stream, "destroy_stream")?;
        let device = stream_state.device;
        let queued = stream_state.pending.len();
        stream_state.destroyed = true;
        stream_state.pending.clear();

        if queued > 0 {
            state.violations.push(format!(
                "stream {:#x} on gpu:{} destroyed with {} op(s) queued",
                stream.0, device, queued
            ));
        }
        if bound {
            state.violations.push(format!(
                "stream {:#x} on gpu:{} destroyed while a library handle is bound to it",
                stream.0, device
            ));
        }
        Ok(())
    }

    fn memset_async(
        &self,
        stream: RawStream,
        ptr: u64,
        value: u8,
        size_bytes: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::Memset {
            stream,
            ptr,
            size: size_bytes,
        });
        let injected = state.take_fault(FaultPoint::Memset);
        let in_bounds = size_bytes == 0
            || state.allocations.iter().any(|(&base, &(_, len))| {
                ptr >= base && ptr + size_bytes as u64 <= base + len as u64
            });

        let stream_state = state.live_stream(stream, "memset_async")?;
        if injected {
            return Err(Error::driver(
                "memset_async",
                stream_state.device,
                "injected failure",
            ));
        }
        if !in_bounds {
            return Err(Error::driver(
                "memset_async",
                stream_state.device,
                format!("{:#x}+{} is not inside a live allocation", ptr, size_bytes),
            ));
        }

        stream_state.pending.push_back(Box::new(move || {
            // SAFETY: the range was inside a live allocation when queued, and
            // the allocation is quarantined rather than freed while work is
            // still pending on its device.
            unsafe { std::ptr::write_bytes(ptr as *mut u8, value, size_bytes) }
        }));
        stream_state.enqueued += 1;
        Ok(())
    }
}

// ============================================================================
// Libraries
// ============================================================================

impl BlasLibrary for EmulatedBackend {
    fn create_handle(&self, device: usize) -> Result<RawBlasHandle> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::CreateBlas) {
            return Err(Error::blas("create_handle", "injected failure"));
        }

        let handle = RawBlasHandle(state.next_handle());
        state.blas.insert(handle, HandleState { stream: None });
        state.events.push(Event::CreateBlas(handle));
        Ok(handle)
    }

    fn set_stream(&self, handle: RawBlasHandle, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.live_stream(stream, "blas_set_stream")?;
        let bound = state
            .blas
            .get_mut(&handle)
            .ok_or_else(|| Error::blas("set_stream", format!("unknown handle {:#x}", handle.0)))?;
        bound.stream = Some(stream);
        state.events.push(Event::BindBlas(handle, stream));
        Ok(())
    }

    fn destroy_handle(&self, handle: RawBlasHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::DestroyBlas(handle));
        state
            .blas
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Error::blas("destroy_handle", format!("unknown handle {:#x}", handle.0)))
    }
}

impl DnnLibrary for EmulatedBackend {
    fn is_available(&self) -> bool {
        self.dnn_available
    }

    fn create_handle(&self, device: usize) -> Result<RawDnnHandle> {
        self.check_device(device)?;
        if !self.dnn_available {
            return Err(Error::dnn("create_handle", "library not available"));
        }
        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::CreateDnn) {
            return Err(Error::dnn("create_handle", "injected failure"));
        }

        let handle = RawDnnHandle(state.next_handle());
        state.dnn.insert(handle, HandleState { stream: None });
        state.events.push(Event::CreateDnn(handle));
        Ok(handle)
    }

    fn set_stream(&self, handle: RawDnnHandle, stream: RawStream) -> Result<()> {
        let mut state = self.state.lock();
        state.live_stream(stream, "dnn_set_stream")?;
        let bound = state
            .dnn
            .get_mut(&handle)
            .ok_or_else(|| Error::dnn("set_stream", format!("unknown handle {:#x}", handle.0)))?;
        bound.stream = Some(stream);
        state.events.push(Event::BindDnn(handle, stream));
        Ok(())
    }

    fn destroy_handle(&self, handle: RawDnnHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::DestroyDnn(handle));
        state
            .dnn
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Error::dnn("destroy_handle", format!("unknown handle {:#x}", handle.0)))
    }
}

// ============================================================================
// Allocator
// ============================================================================

impl Allocator for EmulatedBackend {
    fn allocate(&self, place: Place, size_bytes: usize) -> Result<u64> {
        if let Some(device) = place.device_index() {
            self.check_device(device)?;
        }

        let mut state = self.state.lock();
        if state.take_fault(FaultPoint::Allocate) {
            return Err(Error::OutOfMemory { size: size_bytes });
        }

        let ptr = host_alloc(size_bytes)?;
        if ptr != 0 {
            state.allocations.insert(ptr, (place, size_bytes));
        }
        state.events.push(Event::Allocate {
            place,
            ptr,
            size: size_bytes,
        });
        Ok(ptr)
    }

    fn deallocate(&self, place: Place, ptr: u64, _size_bytes: usize) {
        if ptr == 0 {
            return;
        }

        let mut state = self.state.lock();
        state.events.push(Event::Free { place, ptr });

        let Some((owner, len)) = state.allocations.remove(&ptr) else {
            state
                .violations
                .push(format!("free of unknown pointer {:#x} on {}", ptr, place));
            return;
        };
        if owner != place {
            state.violations.push(format!(
                "{:#x} allocated on {} but freed on {}",
                ptr, owner, place
            ));
        }

        if let Some(device) = owner.device_index() {
            let in_flight = state.in_flight_on(device);
            if in_flight > 0 {
                state.violations.push(format!(
                    "freed {:#x} on gpu:{} while {} op(s) were in flight",
                    ptr, device, in_flight
                ));
                // Leak instead of freeing: queued work may still touch it.
                return;
            }
        }

        host_free(ptr, len);
    }

    fn allocated_bytes(&self) -> usize {
        let state = self.state.lock();
        state.allocations.values().map(|&(_, len)| len).sum()
    }
}
