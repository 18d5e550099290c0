//! Accelerator execution context
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──new()──> Ready ──shutdown()/drop──> Draining ──> Destroyed
//! ```
//!
//! Construction selects the device, caches its metadata and creates, in
//! order: the stream, the stream device adapter, the BLAS handle, the
//! optional DNN handle and the callback queue. If any step fails, the parts
//! already created are released by their own `Drop` and the error is
//! returned.
//!
//! Teardown always runs in the same order and never skips a step:
//!
//! 1. re-select the device
//! 2. drain the stream and check the sticky error state
//! 3. drain the callback queue and stop its worker
//! 4. destroy the BLAS handle, then the DNN handle
//! 5. free the workspace, then the adapter's scratch region
//! 6. destroy the stream
//!
//! Failures are logged and the next step still runs.

use super::callback::CallbackQueue;
use super::stream_device::StreamDevice;
use super::workspace::{Workspace, WorkspaceBuffer};
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::AcceleratorBackend;
use crate::runtime::Allocator;
use crate::runtime::handles::{BlasHandle, DnnHandle, Stream};
use crate::runtime::traits::{DeviceProperties, RawBlasHandle, RawDnnHandle, RawStream};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of an [`AcceleratorContext`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Resources are being created
    ///
    /// Only held inside [`AcceleratorContext::new`]: a constructed context
    /// starts out [`Ready`](Self::Ready) and a failed construction returns
    /// no context at all.
    Uninitialized,
    /// Fully constructed and usable
    Ready,
    /// Teardown in progress
    Draining,
    /// All resources released
    Destroyed,
}

impl ContextState {
    /// Lowercase state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Ready => "ready",
            ContextState::Draining => "draining",
            ContextState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device context: stream, library handles, workspace and callbacks
pub struct AcceleratorContext {
    place: Place,
    device: usize,
    backend: AcceleratorBackend,
    properties: DeviceProperties,
    state: ContextState,
    stream: Stream,
    stream_device: StreamDevice,
    blas: BlasHandle,
    dnn: Option<DnnHandle>,
    workspace: Workspace,
    callbacks: CallbackQueue,
}

impl AcceleratorContext {
    /// Build the context for accelerator `device`
    pub fn new(
        device: usize,
        backend: AcceleratorBackend,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self> {
        let place = Place::Accelerator(device);
        let driver = backend.driver().clone();

        let count = driver.device_count()?;
        if device >= count {
            return Err(Error::InvalidDevice { device, count });
        }

        driver.set_device(device)?;
        let properties = driver.properties(device)?;

        let stream = Stream::create(&driver, device)?;
        let stream_device =
            StreamDevice::new(place, stream.raw(), driver.clone(), allocator.clone());

        let blas = BlasHandle::create(backend.blas(), device)?;
        blas.bind(&stream)?;

        let dnn = if backend.dnn().is_available() {
            let handle = DnnHandle::create(backend.dnn(), device)?;
            handle.bind(&stream)?;
            Some(handle)
        } else {
            None
        };

        let callbacks = CallbackQueue::new(driver.clone(), stream.raw(), device)?;
        let workspace = Workspace::new(place, allocator);

        tracing::info!(
            "device: {}, compute capability: {}, driver version: {}, runtime version: {}",
            device,
            properties.compute_capability,
            properties.driver_version_string(),
            properties.runtime_version_string(),
        );

        Ok(Self {
            place,
            device,
            backend,
            properties,
            state: ContextState::Ready,
            stream,
            stream_device,
            blas,
            dnn,
            workspace,
            callbacks,
        })
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != ContextState::Ready {
            return Err(Error::ContextNotReady {
                place: self.place,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Place this context serves
    #[inline]
    pub fn place(&self) -> Place {
        self.place
    }

    /// Accelerator index
    #[inline]
    pub fn device_index(&self) -> usize {
        self.device
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Capabilities this context was built from
    #[inline]
    pub fn backend(&self) -> &AcceleratorBackend {
        &self.backend
    }

    /// The context's stream. Ownership stays with the context.
    #[inline]
    pub fn stream(&self) -> RawStream {
        self.stream.raw()
    }

    /// Device adapter bound to the stream
    ///
    /// After [`shutdown`](Self::shutdown) the adapter refuses scratch and
    /// stream use.
    #[inline]
    pub fn stream_device(&self) -> &StreamDevice {
        &self.stream_device
    }

    /// BLAS handle bound to the stream
    #[inline]
    pub fn blas_handle(&self) -> RawBlasHandle {
        self.blas.raw()
    }

    /// DNN handle bound to the stream, if the library is available
    #[inline]
    pub fn dnn_handle(&self) -> Option<RawDnnHandle> {
        self.dnn.as_ref().map(DnnHandle::raw)
    }

    // ========================================================================
    // Device metadata
    // ========================================================================

    /// Cached device metadata
    #[inline]
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Compute capability as `10 * major + minor`
    #[inline]
    pub fn compute_capability(&self) -> u32 {
        self.properties.compute_capability
    }

    /// Number of multiprocessors
    #[inline]
    pub fn multiprocessor_count(&self) -> u32 {
        self.properties.multiprocessor_count
    }

    /// Resident thread limit per multiprocessor
    #[inline]
    pub fn max_threads_per_multiprocessor(&self) -> u32 {
        self.properties.max_threads_per_multiprocessor
    }

    /// Multiprocessors times threads per multiprocessor
    #[inline]
    pub fn max_physical_thread_count(&self) -> u64 {
        self.properties.max_physical_thread_count()
    }

    /// Driver version in vendor encoding
    #[inline]
    pub fn driver_version(&self) -> i32 {
        self.properties.driver_version
    }

    /// Runtime version in vendor encoding
    #[inline]
    pub fn runtime_version(&self) -> i32 {
        self.properties.runtime_version
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Block until all work queued on the stream so far has completed
    ///
    /// Asynchronous device faults surface here. This is the only call that
    /// guarantees prior work is complete.
    pub fn wait(&self) -> Result<()> {
        self.ensure_ready()?;
        self.drain()
    }

    fn drain(&self) -> Result<()> {
        self.stream.synchronize()?;
        self.backend.driver().last_error(self.device)
    }

    /// Run `callback` on the callback worker once all stream work queued
    /// before this call has completed
    ///
    /// Callbacks run one at a time in the order they were added.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.ensure_ready()?;
        self.callbacks.add(callback)
    }

    /// Block until every added callback has run
    ///
    /// Reports the first failure (driver fault or panic) since the previous
    /// call.
    pub fn wait_callback(&self) -> Result<()> {
        self.ensure_ready()?;
        self.callbacks.wait()
    }

    /// Callbacks added but not yet finished
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.outstanding()
    }

    // ========================================================================
    // Workspace
    // ========================================================================

    /// Run `op` with exclusive use of a workspace of at least `required_bytes`
    ///
    /// This mutates shared state: concurrent callers are serialized on the
    /// workspace lock for the whole duration of `op`. When the workspace has
    /// to grow, the stream is drained before the old buffer is freed, and the
    /// new buffer is exactly `required_bytes`. It never shrinks, and a failed
    /// growth leaves the current buffer in place.
    pub fn run_with_workspace<R>(
        &self,
        required_bytes: usize,
        op: impl FnOnce(WorkspaceBuffer) -> R,
    ) -> Result<R> {
        self.ensure_ready()?;
        self.workspace.run(required_bytes, &self.stream, op)
    }

    /// Current workspace capacity in bytes
    pub fn workspace_capacity(&self) -> usize {
        self.workspace.capacity()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release every resource in teardown order. Idempotent.
    ///
    /// Returns the first failure; later steps still run.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state != ContextState::Ready {
            return Ok(());
        }
        self.state = ContextState::Draining;

        let place = self.place;
        let mut first_error = None;
        let mut check = |step: &'static str, result: Result<()>| {
            if let Err(e) = result {
                tracing::error!(%place, step, error = %e, "accelerator teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        check("set_device", self.backend.driver().set_device(self.device));
        check("wait", self.drain());
        check("callbacks", self.callbacks.stop());
        check("blas", self.blas.destroy());
        if let Some(dnn) = self.dnn.as_mut() {
            check("dnn", dnn.destroy());
        }
        self.workspace.release();
        self.stream_device.release();
        check("stream", self.stream.destroy());

        self.state = ContextState::Destroyed;
        tracing::debug!(%place, "accelerator context destroyed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for AcceleratorContext {
    fn drop(&mut self) {
        // Step failures were already logged.
        let _ = self.shutdown();
    }
}

impl fmt::Debug for AcceleratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorContext")
            .field("place", &self.place)
            .field("state", &self.state)
            .field("stream", &self.stream.raw())
            .field("dnn", &self.dnn.is_some())
            .field("workspace_capacity", &self.workspace_capacity())
            .finish()
    }
}
