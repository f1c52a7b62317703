use std::future::Future;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::warn;

/// Fixed-size worker pool backed by a dedicated multi-thread tokio runtime.
///
/// The event bus and the scheduler each own one of these, independently.
/// Jobs submitted after shutdown are dropped (with a warning), never
/// queued: a stopped pool stays stopped.
pub struct WorkerPool {
    name: String,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// Build a pool with `workers` OS threads. The name shows up in thread
    /// names and log lines.
    pub fn new(name: &str, workers: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(format!("wisp-{name}"))
            .enable_time()
            .build()?;

        Ok(Self {
            name: name.to_string(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Run a blocking job on the pool. Returns false if the pool has been
    /// shut down and the job was dropped.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.spawn_future(async move { job() }).is_some()
    }

    /// Run a future on the pool, returning its handle for best-effort
    /// cancellation via `abort()`. Returns None if the pool has been shut
    /// down.
    pub fn spawn_future<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(runtime) => Some(runtime.spawn(future)),
            None => {
                warn!(target: "worker", "pool '{}' is shut down, dropping job", self.name);
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Drain the pool within `grace`, then force-stop whatever is left.
    /// Idempotent.
    pub fn shutdown(&self, grace: Duration) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(grace);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Don't block the dropping thread; tasks still in flight are
        // abandoned.
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}
