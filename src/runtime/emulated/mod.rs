//! Host-emulated accelerator backend
//!
//! `EmulatedBackend` implements every accelerator capability (driver, BLAS,
//! DNN, allocator) on top of host memory. Streams really are deferred: work
//! enqueued with [`EmulatedBackend::enqueue`] (and `memset_async`) only runs
//! when the stream is synchronized, so code that forgets to drain before
//! reusing memory misbehaves here the same way it would on a GPU.
//!
//! Every capability call is appended to an ordered [`Event`] log, and
//! ordering mistakes a real driver would punish with undefined behavior are
//! recorded as violations instead:
//!
//! - freeing device memory while a stream on that device has work in flight
//! - destroying a stream that still has queued work
//! - destroying a stream while a BLAS/DNN handle is still bound to it
//! - touching a stream after it was destroyed
//!
//! Streams drain independently of each other. A work item must not
//! synchronize the stream it runs on; that blocks forever, as it would
//! from inside a real stream callback.
//!
//! One-shot failures can be armed per call site with
//! [`EmulatedBackend::fail_next`], and asynchronous faults with
//! [`EmulatedBackend::inject_async_fault`].

mod capabilities;

use super::backend::AcceleratorBackend;
use super::traits::{DeviceProperties, RawBlasHandle, RawDnnHandle, RawStream};
use crate::error::{Error, Result};
use crate::place::Place;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Deferred unit of stream work
type Work = Box<dyn FnOnce() + Send>;

/// One capability call observed by the emulated backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Active device selected
    SetDevice(usize),
    /// Device metadata queried
    QueryProperties(usize),
    /// Stream created
    CreateStream {
        /// Owning device
        device: usize,
        /// New stream
        stream: RawStream,
    },
    /// Stream drained
    Synchronize(RawStream),
    /// Sticky error state checked
    CheckLastError(usize),
    /// Stream destroyed
    DestroyStream(RawStream),
    /// Async fill enqueued
    Memset {
        /// Stream the fill was queued on
        stream: RawStream,
        /// Target address
        ptr: u64,
        /// Bytes to fill
        size: usize,
    },
    /// BLAS handle created
    CreateBlas(RawBlasHandle),
    /// BLAS handle bound to a stream
    BindBlas(RawBlasHandle, RawStream),
    /// BLAS handle destroyed
    DestroyBlas(RawBlasHandle),
    /// DNN handle created
    CreateDnn(RawDnnHandle),
    /// DNN handle bound to a stream
    BindDnn(RawDnnHandle, RawStream),
    /// DNN handle destroyed
    DestroyDnn(RawDnnHandle),
    /// Memory allocated
    Allocate {
        /// Place of the allocation
        place: Place,
        /// Returned address
        ptr: u64,
        /// Size in bytes
        size: usize,
    },
    /// Memory freed
    Free {
        /// Place of the allocation
        place: Place,
        /// Freed address
        ptr: u64,
    },
}

/// Capability call that can be armed to fail once
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `DeviceDriver::set_device`
    SetDevice,
    /// `DeviceDriver::properties`
    Properties,
    /// `DeviceDriver::create_stream`
    CreateStream,
    /// `DeviceDriver::synchronize`
    Synchronize,
    /// `DeviceDriver::destroy_stream`
    DestroyStream,
    /// `DeviceDriver::memset_async`
    Memset,
    /// `BlasLibrary::create_handle`
    CreateBlas,
    /// `DnnLibrary::create_handle`
    CreateDnn,
    /// `Allocator::allocate`
    Allocate,
}

#[derive(Default)]
struct StreamState {
    device: usize,
    /// Serializes draining of this stream so its work runs in FIFO order
    exec: Arc<Mutex<()>>,
    pending: VecDeque<Work>,
    enqueued: u64,
    completed: u64,
    fault: Option<String>,
    destroyed: bool,
}

struct HandleState {
    stream: Option<RawStream>,
}

#[derive(Default)]
struct EmulatedState {
    next_handle: u64,
    active_device: Option<usize>,
    streams: HashMap<RawStream, StreamState>,
    blas: HashMap<RawBlasHandle, HandleState>,
    dnn: HashMap<RawDnnHandle, HandleState>,
    allocations: HashMap<u64, (Place, usize)>,
    armed: Vec<FaultPoint>,
    sticky: HashMap<usize, String>,
    events: Vec<Event>,
    violations: Vec<String>,
}

impl EmulatedState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Consume an armed failure for `point`, if any.
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        match self.armed.iter().position(|&p| p == point) {
            Some(index) => {
                self.armed.remove(index);
                true
            }
            None => false,
        }
    }

    fn live_stream(&mut self, stream: RawStream, op: &'static str) -> Result<&mut StreamState> {
        let violation = match self.streams.get(&stream) {
            None => format!("{op} on unknown stream {:#x}", stream.0),
            Some(state) if state.destroyed => {
                format!("{op} on destroyed stream {:#x}", stream.0)
            }
            Some(_) => String::new(),
        };

        if !violation.is_empty() {
            self.violations.push(violation.clone());
            return Err(Error::driver(op, 0, violation));
        }

        self.streams
            .get_mut(&stream)
            .ok_or_else(|| Error::Internal(format!("stream {:#x} vanished", stream.0)))
    }

    fn in_flight_on(&self, device: usize) -> usize {
        self.streams
            .values()
            .filter(|s| !s.destroyed && s.device == device)
            .map(|s| s.pending.len())
            .sum()
    }
}

/// Host-memory accelerator emulation
///
/// Share it through an `Arc` and hand out capabilities with
/// [`EmulatedBackend::accelerator_backend`] and
/// [`EmulatedBackend::allocator`].
pub struct EmulatedBackend {
    device_count: usize,
    properties: DeviceProperties,
    dnn_available: bool,
    state: Mutex<EmulatedState>,
}

impl EmulatedBackend {
    /// Emulate `device_count` identical devices
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            properties: DeviceProperties {
                compute_capability: 86,
                multiprocessor_count: 82,
                max_threads_per_multiprocessor: 1536,
                driver_version: 12040,
                runtime_version: 12040,
            },
            dnn_available: false,
            state: Mutex::new(EmulatedState::default()),
        }
    }

    /// Report a convolution library as present (or not)
    pub fn with_dnn(mut self, available: bool) -> Self {
        self.dnn_available = available;
        self
    }

    /// Override the metadata reported for every device
    pub fn with_properties(mut self, properties: DeviceProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Driver, BLAS and DNN capabilities backed by this emulation
    pub fn accelerator_backend(self: &Arc<Self>) -> AcceleratorBackend {
        AcceleratorBackend::new(self.clone(), self.clone(), self.clone())
    }

    /// Allocator backed by this emulation
    pub fn allocator(self: &Arc<Self>) -> Arc<dyn crate::runtime::Allocator> {
        self.clone()
    }

    /// Number of emulated devices
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    // ------------------------------------------------------------------------
    // Stream work
    // ------------------------------------------------------------------------

    /// Queue `work` on `stream`; it runs at the next synchronize.
    pub fn enqueue(&self, stream: RawStream, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock();
        let stream_state = state.live_stream(stream, "enqueue")?;
        stream_state.pending.push_back(Box::new(work));
        stream_state.enqueued += 1;
        Ok(())
    }

    /// Work items queued on `stream` that have not run yet
    pub fn pending_ops(&self, stream: RawStream) -> usize {
        let state = self.state.lock();
        state.streams.get(&stream).map_or(0, |s| s.pending.len())
    }

    /// Work items `stream` has completed
    pub fn completed_ops(&self, stream: RawStream) -> u64 {
        let state = self.state.lock();
        state.streams.get(&stream).map_or(0, |s| s.completed)
    }

    /// Work items ever queued on `stream`
    pub fn enqueued_ops(&self, stream: RawStream) -> u64 {
        let state = self.state.lock();
        state.streams.get(&stream).map_or(0, |s| s.enqueued)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make the next call at `point` fail
    pub fn fail_next(&self, point: FaultPoint) {
        self.state.lock().armed.push(point);
    }

    /// Report `reason` from the next synchronize of `stream`
    pub fn inject_async_fault(&self, stream: RawStream, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if let Some(stream_state) = state.streams.get_mut(&stream) {
            stream_state.fault = Some(reason.into());
        }
    }

    /// Report `reason` from the next last-error check on `device`
    pub fn inject_sticky_error(&self, device: usize, reason: impl Into<String>) {
        self.state.lock().sticky.insert(device, reason.into());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Every capability call so far, in order
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Forget recorded events
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Ordering violations observed so far
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Device most recently selected with `set_device`
    pub fn active_device(&self) -> Option<usize> {
        self.state.lock().active_device
    }

    /// Streams created and not yet destroyed
    pub fn live_streams(&self) -> usize {
        let state = self.state.lock();
        state.streams.values().filter(|s| !s.destroyed).count()
    }

    /// BLAS handles created and not yet destroyed
    pub fn live_blas_handles(&self) -> usize {
        self.state.lock().blas.len()
    }

    /// DNN handles created and not yet destroyed
    pub fn live_dnn_handles(&self) -> usize {
        self.state.lock().dnn.len()
    }

    /// Allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }
}
