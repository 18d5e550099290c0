//! Host context with a thread-scoped object cache
//!
//! Primitive libraries cache compiled kernels and reorder descriptors per
//! worker thread. Each worker announces its identity with
//! [`set_current_thread_id`]; the cache keeps one `name -> blob` row per id.
//! Entries are only inserted or overwritten, never evicted, for the life of
//! the context.

use super::host::{HostContext, HostDevice};
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::Allocator;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Caller-assigned worker identity
pub type ThreadId = usize;

/// Shared, type-erased cached object
pub type Blob = Arc<dyn Any + Send + Sync>;

thread_local! {
    static CURRENT_THREAD_ID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Set the cache identity of the calling OS thread
pub fn set_current_thread_id(id: ThreadId) {
    CURRENT_THREAD_ID.with(|current| current.set(Some(id)));
}

/// Cache identity of the calling OS thread, if one was set
pub fn current_thread_id() -> Option<ThreadId> {
    CURRENT_THREAD_ID.with(Cell::get)
}

/// Forget the cache identity of the calling OS thread
pub fn clear_current_thread_id() {
    CURRENT_THREAD_ID.with(|current| current.set(None));
}

/// Host context carrying a per-thread keyed blob cache
pub struct BlobCacheContext {
    host: HostContext,
    rows: Mutex<HashMap<ThreadId, HashMap<String, Blob>>>,
}

impl BlobCacheContext {
    /// Create a cache context for [`Place::Host`]
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            host: HostContext::new(Place::Host, allocator),
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Place this context serves
    #[inline]
    pub fn place(&self) -> Place {
        self.host.place()
    }

    /// Host device adapter
    #[inline]
    pub fn device(&self) -> &HostDevice {
        self.host.device()
    }

    /// Host work is synchronous; always succeeds.
    pub fn wait(&self) -> Result<()> {
        self.host.wait()
    }

    /// Insert or overwrite `name` in the calling thread's row
    ///
    /// Fails with [`Error::ThreadIdUnset`] if the thread never called
    /// [`set_current_thread_id`].
    pub fn set_blob(&self, name: impl Into<String>, blob: Blob) -> Result<()> {
        let id = current_thread_id().ok_or(Error::ThreadIdUnset)?;
        self.set_blob_for(id, name, blob);
        Ok(())
    }

    /// Look up `name` in the calling thread's row
    ///
    /// A thread without an identity has no row, so this is a miss.
    pub fn get_blob(&self, name: &str) -> Option<Blob> {
        self.get_blob_for(current_thread_id()?, name)
    }

    /// Typed lookup; `None` on a miss or if the blob is not a `T`
    pub fn get_blob_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get_blob(name)?.downcast::<T>().ok()
    }

    /// Insert or overwrite `name` in the row of thread `id`
    pub fn set_blob_for(&self, id: ThreadId, name: impl Into<String>, blob: Blob) {
        self.rows
            .lock()
            .entry(id)
            .or_default()
            .insert(name.into(), blob);
    }

    /// Look up `name` in the row of thread `id`
    pub fn get_blob_for(&self, id: ThreadId, name: &str) -> Option<Blob> {
        self.rows.lock().get(&id)?.get(name).cloned()
    }

    /// Total cached entries across all rows
    pub fn blob_count(&self) -> usize {
        self.rows.lock().values().map(HashMap::len).sum()
    }

    /// Number of threads that own a row
    pub fn thread_rows(&self) -> usize {
        self.rows.lock().len()
    }
}

impl fmt::Debug for BlobCacheContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobCacheContext")
            .field("place", &self.place())
            .field("thread_rows", &self.thread_rows())
            .field("blob_count", &self.blob_count())
            .finish()
    }
}
