//! Growable scratch workspace for accelerator contexts

use crate::error::Result;
use crate::place::Place;
use crate::runtime::Allocator;
use crate::runtime::handles::Stream;
use parking_lot::Mutex;
use std::sync::Arc;

/// View of the workspace handed to a workspace-consuming operation
///
/// Only valid for the duration of the closure it was passed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkspaceBuffer {
    ptr: u64,
    len: usize,
}

impl WorkspaceBuffer {
    /// Device address of the buffer (`0` when empty)
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Usable size in bytes, at least the requested size
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the buffer zero-sized?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Slot {
    ptr: u64,
    capacity: usize,
}

/// Single growable buffer, one consumer at a time
///
/// Capacity only grows. Growth synchronizes the owning stream before the
/// old buffer is freed because queued kernels may still be reading it.
pub(crate) struct Workspace {
    place: Place,
    allocator: Arc<dyn Allocator>,
    slot: Mutex<Slot>,
}

impl Workspace {
    pub(crate) fn new(place: Place, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            place,
            allocator,
            slot: Mutex::new(Slot {
                ptr: 0,
                capacity: 0,
            }),
        }
    }

    /// Run `op` with a buffer of at least `required_bytes`, growing first if needed
    pub(crate) fn run<R>(
        &self,
        required_bytes: usize,
        stream: &Stream,
        op: impl FnOnce(WorkspaceBuffer) -> R,
    ) -> Result<R> {
        let mut slot = self.slot.lock();
        if required_bytes > slot.capacity {
            self.grow(&mut slot, required_bytes, stream)?;
        }

        let buffer = WorkspaceBuffer {
            ptr: slot.ptr,
            len: slot.capacity,
        };
        Ok(op(buffer))
    }

    /// The slot is only touched once every fallible step has succeeded, so
    /// a failed growth keeps the old buffer and capacity.
    fn grow(&self, slot: &mut Slot, required_bytes: usize, stream: &Stream) -> Result<()> {
        let ptr = self.allocator.allocate(self.place, required_bytes)?;

        if slot.ptr != 0 {
            // Someone may still be using the current buffer.
            if let Err(e) = stream.synchronize() {
                self.allocator.deallocate(self.place, ptr, required_bytes);
                return Err(e);
            }
            self.allocator
                .deallocate(self.place, slot.ptr, slot.capacity);
        }

        slot.ptr = ptr;
        slot.capacity = required_bytes;

        tracing::debug!(place = %self.place, bytes = required_bytes, "workspace grown");
        Ok(())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slot.lock().capacity
    }

    /// Free the buffer. The stream must already be drained.
    pub(crate) fn release(&self) {
        let mut slot = self.slot.lock();
        if slot.ptr != 0 {
            self.allocator
                .deallocate(self.place, slot.ptr, slot.capacity);
        }
        slot.ptr = 0;
        slot.capacity = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::emulated::{EmulatedBackend, Event, FaultPoint};
    use crate::runtime::traits::DeviceDriver;

    fn setup() -> (Arc<EmulatedBackend>, Stream, Workspace) {
        let emu = Arc::new(EmulatedBackend::new(1));
        let driver: Arc<dyn DeviceDriver> = emu.clone();
        let stream = Stream::create(&driver, 0).unwrap();
        let workspace = Workspace::new(Place::Accelerator(0), emu.allocator());
        (emu, stream, workspace)
    }

    #[test]
    fn test_first_use_allocates_exactly() {
        let (_emu, stream, workspace) = setup();
        assert_eq!(workspace.capacity(), 0);

        let len = workspace.run(100, &stream, |buf| buf.len()).unwrap();
        assert_eq!(len, 100);
        assert_eq!(workspace.capacity(), 100);
        workspace.release();
    }

    #[test]
    fn test_never_shrinks() {
        let (emu, stream, workspace) = setup();
        let first = workspace.run(256, &stream, |buf| buf.ptr()).unwrap();
        let second = workspace.run(16, &stream, |buf| buf.ptr()).unwrap();

        assert_eq!(first, second);
        assert_eq!(workspace.capacity(), 256);
        assert_eq!(emu.live_allocations(), 1);
        workspace.release();
        assert_eq!(emu.live_allocations(), 0);
    }

    #[test]
    fn test_growth_synchronizes_before_free() {
        let (emu, stream, workspace) = setup();
        workspace.run(8, &stream, |_| ()).unwrap();
        emu.enqueue(stream.raw(), || {}).unwrap();
        emu.clear_events();

        workspace.run(64, &stream, |_| ()).unwrap();

        let events = emu.events();
        let sync = events
            .iter()
            .position(|e| matches!(e, Event::Synchronize(_)))
            .unwrap();
        let free = events
            .iter()
            .position(|e| matches!(e, Event::Free { .. }))
            .unwrap();
        assert!(sync < free);
        assert!(emu.violations().is_empty());
        workspace.release();
    }

    #[test]
    fn test_failed_growth_keeps_old_buffer() {
        let (emu, stream, workspace) = setup();
        let old = workspace.run(4096, &stream, |buf| buf.ptr()).unwrap();

        emu.fail_next(FaultPoint::Allocate);
        assert!(matches!(
            workspace.run(8192, &stream, |_| ()),
            Err(Error::OutOfMemory { size: 8192 })
        ));
        assert_eq!(workspace.capacity(), 4096);
        assert_eq!(emu.live_allocations(), 1);

        let buf = workspace.run(4096, &stream, |buf| buf).unwrap();
        assert_eq!(buf.ptr(), old);
        assert_eq!(buf.len(), 4096);
        workspace.release();
        assert_eq!(emu.live_allocations(), 0);
    }

    #[test]
    fn test_failed_drain_keeps_old_buffer() {
        let (emu, stream, workspace) = setup();
        let old = workspace.run(64, &stream, |buf| buf.ptr()).unwrap();

        emu.fail_next(FaultPoint::Synchronize);
        assert!(workspace.run(128, &stream, |_| ()).is_err());
        assert_eq!(workspace.capacity(), 64);
        assert_eq!(emu.live_allocations(), 1);
        assert_eq!(workspace.run(64, &stream, |buf| buf.ptr()).unwrap(), old);
        workspace.release();
    }

    #[test]
    fn test_zero_request_runs_without_allocating() {
        let (emu, stream, workspace) = setup();
        let buf = workspace.run(0, &stream, |buf| buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(emu.live_allocations(), 0);
    }
}
