//! Execution contexts
//!
//! One context exists per [`Place`]. The variant is chosen by place kind and
//! registry configuration:
//!
//! ```text
//! ExecutionContext
//! ├── Host          Place::Host, plain
//! ├── BlobCache     Place::Host, with a per-thread object cache
//! ├── Pinned        Place::HostPinned
//! └── Accelerator   Place::Accelerator(i): stream, BLAS/DNN handles,
//!                   workspace, callback queue
//! ```

mod accelerator;
mod blob_cache;
mod callback;
mod host;
mod stream_device;
mod workspace;

pub use accelerator::{AcceleratorContext, ContextState};
pub use blob_cache::{
    Blob, BlobCacheContext, ThreadId, clear_current_thread_id, current_thread_id,
    set_current_thread_id,
};
pub use host::{HostContext, HostDevice};
pub use stream_device::{SCRATCH_SIZE, StreamDevice};
pub use workspace::WorkspaceBuffer;

use crate::error::Result;
use crate::place::Place;
use crate::runtime::traits::Device;

/// Execution context for one place
#[derive(Debug)]
pub enum ExecutionContext {
    /// Plain host context
    Host(HostContext),
    /// Host context with a per-thread object cache
    BlobCache(BlobCacheContext),
    /// Pinned host staging context
    Pinned(HostContext),
    /// Accelerator device context
    Accelerator(AcceleratorContext),
}

impl ExecutionContext {
    /// Place this context serves
    pub fn place(&self) -> Place {
        match self {
            ExecutionContext::Host(ctx) | ExecutionContext::Pinned(ctx) => ctx.place(),
            ExecutionContext::BlobCache(ctx) => ctx.place(),
            ExecutionContext::Accelerator(ctx) => ctx.place(),
        }
    }

    /// Device adapter for elementwise kernel dispatch
    pub fn device(&self) -> &dyn Device {
        match self {
            ExecutionContext::Host(ctx) | ExecutionContext::Pinned(ctx) => ctx.device(),
            ExecutionContext::BlobCache(ctx) => ctx.device(),
            ExecutionContext::Accelerator(ctx) => ctx.stream_device(),
        }
    }

    /// Block until all work issued through this context has completed
    pub fn wait(&self) -> Result<()> {
        match self {
            ExecutionContext::Host(ctx) | ExecutionContext::Pinned(ctx) => ctx.wait(),
            ExecutionContext::BlobCache(ctx) => ctx.wait(),
            ExecutionContext::Accelerator(ctx) => ctx.wait(),
        }
    }

    /// Variant name
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionContext::Host(_) => "host",
            ExecutionContext::BlobCache(_) => "blob_cache",
            ExecutionContext::Pinned(_) => "pinned",
            ExecutionContext::Accelerator(_) => "accelerator",
        }
    }

    /// Accelerator context, if this is one
    pub fn as_accelerator(&self) -> Option<&AcceleratorContext> {
        match self {
            ExecutionContext::Accelerator(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Blob cache context, if this is one
    pub fn as_blob_cache(&self) -> Option<&BlobCacheContext> {
        match self {
            ExecutionContext::BlobCache(ctx) => Some(ctx),
            _ => None,
        }
    }
}
