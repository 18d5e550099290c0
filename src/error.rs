//! Error types for devctx

use crate::place::Place;
use thiserror::Error;

/// Result type alias using devctx's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving execution contexts
#[derive(Error, Debug)]
pub enum Error {
    /// A registry was requested for no places at all
    #[error("Cannot build a context registry from an empty place set")]
    EmptyPlaceSet,

    /// The place kind cannot be served by this build or configuration
    #[error("'{place}' is not supported: {reason}")]
    UnsupportedPlace {
        /// The rejected place
        place: Place,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A textual place description could not be parsed
    #[error("Invalid place '{input}': expected cpu, cpu_pinned or gpu:<index>")]
    InvalidPlace {
        /// The text that failed to parse
        input: String,
    },

    /// Lookup of a place that has no context in the registry
    #[error("'{place}' is not supported: no execution context was built for it")]
    PlaceNotRegistered {
        /// The place that was looked up
        place: Place,
    },

    /// Accelerator index outside of the devices reported by the driver
    #[error("Invalid device {device}: driver reports {count} device(s)")]
    InvalidDevice {
        /// Requested device index
        device: usize,
        /// Number of devices visible to the driver
        count: usize,
    },

    /// Device driver call failed
    #[error("Driver error on device {device} during {op}: {reason}")]
    Driver {
        /// The driver operation that failed
        op: &'static str,
        /// Device index the call targeted
        device: usize,
        /// Driver-provided description
        reason: String,
    },

    /// Asynchronous device fault reported while waiting on a stream
    #[error("Asynchronous fault on device {device}: {reason}")]
    AsyncFault {
        /// Device index of the faulting stream
        device: usize,
        /// Driver-provided description
        reason: String,
    },

    /// Linear-algebra library failure
    #[error("BLAS error during {op}: {reason}")]
    Blas {
        /// The library operation that failed
        op: &'static str,
        /// Library-provided description
        reason: String,
    },

    /// Convolution/primitives library failure
    #[error("DNN error during {op}: {reason}")]
    Dnn {
        /// The library operation that failed
        op: &'static str,
        /// Library-provided description
        reason: String,
    },

    /// Out of memory
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// A deferred stream callback could not run to completion
    #[error("Stream callback failed: {0}")]
    CallbackFailed(String),

    /// Operation on an accelerator context that is no longer ready
    #[error("Context for '{place}' is not ready (state: {state})")]
    ContextNotReady {
        /// Place of the context
        place: Place,
        /// Lifecycle state the context is in
        state: &'static str,
    },

    /// Blob cache write from a thread that never set its cache thread id
    #[error("Current thread has no cache thread id; call set_current_thread_id first")]
    ThreadIdUnset,

    /// CUDA-specific error
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an unsupported place error
    pub fn unsupported_place(place: Place, reason: &'static str) -> Self {
        Self::UnsupportedPlace { place, reason }
    }

    /// Create a driver error from any displayable cause
    pub fn driver(op: &'static str, device: usize, reason: impl Into<String>) -> Self {
        Self::Driver {
            op,
            device,
            reason: reason.into(),
        }
    }

    /// Create a BLAS error from any displayable cause
    pub fn blas(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Blas {
            op,
            reason: reason.into(),
        }
    }

    /// Create a DNN error from any displayable cause
    pub fn dnn(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Dnn {
            op,
            reason: reason.into(),
        }
    }
}
