//! # devctx
//!
//! **Per-device execution contexts for numerical runtimes.**
//!
//! devctx creates, owns and serves one execution context per device. An
//! accelerator context bundles a compute stream, linear-algebra and
//! convolution library handles bound to that stream, a growable scratch
//! workspace and a deferred-callback queue. Host contexts are lightweight
//! and may carry a per-thread object cache.
//!
//! ## Features
//!
//! - **Registry**: exactly one context per [`Place`], built up front,
//!   lock-free lookups
//! - **Ordered teardown**: accelerator contexts drain their stream before
//!   releasing any handle or buffer
//! - **Workspace**: monotonically growing scratch buffer, drained before reuse
//! - **Capability traits**: driver, BLAS, DNN and allocator are injected, so
//!   the same contexts run on CUDA or on the host-memory emulation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use devctx::prelude::*;
//! use devctx::runtime::emulated::EmulatedBackend;
//! use std::sync::Arc;
//!
//! let emu = Arc::new(EmulatedBackend::new(2));
//! let registry = ContextRegistry::builder()
//!     .places([Place::Host, Place::Accelerator(0), Place::Accelerator(1)])
//!     .accelerator(emu.accelerator_backend())
//!     .allocator(emu.allocator())
//!     .build()?;
//!
//! registry.accelerator(1)?.wait()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cuda`: NVIDIA CUDA backend through cudarc (driver API + cuBLAS)
//! - `cudnn`: cuDNN handles on accelerator contexts (implies `cuda`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;
pub mod place;
pub mod registry;
pub mod runtime;

pub use place::Place;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{
        AcceleratorContext, BlobCacheContext, ContextState, ExecutionContext, HostContext,
        WorkspaceBuffer, set_current_thread_id,
    };
    pub use crate::error::{Error, Result};
    pub use crate::place::Place;
    pub use crate::registry::{ContextRegistry, HostVariant, RegistryBuilder};
    pub use crate::runtime::{AcceleratorBackend, Allocator, Device, HostAllocator};

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::{cuda_allocator, cuda_backend, is_cuda_available};
}
