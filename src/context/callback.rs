//! Deferred host callbacks ordered after stream work
//!
//! Each callback is a job on a single-thread rayon pool. The job first
//! synchronizes the stream, so everything enqueued before `add` has finished
//! by the time the callback runs. One worker thread keeps callbacks in FIFO
//! order.

use crate::error::{Error, Result};
use crate::runtime::traits::{DeviceDriver, RawStream};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Default)]
struct Pending {
    outstanding: usize,
    first_error: Option<String>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    idle: Condvar,
}

impl Shared {
    fn finish(&self, outcome: std::result::Result<(), String>) {
        let mut pending = self.pending.lock();
        if let Err(reason) = outcome {
            tracing::error!(%reason, "stream callback failed");
            pending.first_error.get_or_insert(reason);
        }
        pending.outstanding -= 1;
        if pending.outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

pub(crate) struct CallbackQueue {
    stream: RawStream,
    driver: Arc<dyn DeviceDriver>,
    shared: Arc<Shared>,
    pool: Option<rayon::ThreadPool>,
}

impl CallbackQueue {
    pub(crate) fn new(driver: Arc<dyn DeviceDriver>, stream: RawStream, device: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(move |_| format!("devctx-callback-gpu{}", device))
            .build()
            .map_err(|e| Error::Internal(format!("failed to start callback worker: {}", e)))?;

        Ok(Self {
            stream,
            driver,
            shared: Arc::new(Shared::default()),
            pool: Some(pool),
        })
    }

    pub(crate) fn add(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::CallbackFailed("callback queue is stopped".to_string()))?;

        self.shared.pending.lock().outstanding += 1;

        let driver = self.driver.clone();
        let stream = self.stream;
        let shared = self.shared.clone();
        pool.spawn_fifo(move || {
            let outcome = driver
                .synchronize(stream)
                .map_err(|e| e.to_string())
                .and_then(|()| {
                    panic::catch_unwind(AssertUnwindSafe(callback)).map_err(panic_message)
                });
            shared.finish(outcome);
        });
        Ok(())
    }

    /// Block until every queued callback ran; report the first failure since
    /// the last wait.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut pending = self.shared.pending.lock();
        while pending.outstanding > 0 {
            self.shared.idle.wait(&mut pending);
        }
        match pending.first_error.take() {
            Some(reason) => Err(Error::CallbackFailed(reason)),
            None => Ok(()),
        }
    }

    /// Drain outstanding callbacks and stop the worker. Idempotent.
    pub(crate) fn stop(&mut self) -> Result<()> {
        let drained = self.wait();
        self.pool = None;
        drained
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.shared.pending.lock().outstanding
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("callback panicked: {}", message)
    } else {
        "callback panicked".to_string()
    }
}
