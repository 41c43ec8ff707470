//! Execution affinity.
//!
//! An affinity is the context a session's work runs on. Timer callbacks are
//! never run on the wheel's own task; they are handed to the affinity the
//! owner is bound to when the timer fires.

use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Unit of work handed to an affinity
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context that runs jobs
pub trait Affinity: Send + Sync + fmt::Debug {
    /// Run `job` on this context. Jobs submitted to one context from one
    /// thread run in submission order if the context is serial.
    fn execute(&self, job: Job);
}

/// Runs jobs one at a time, in order, on a dedicated tokio task
pub struct SerialExecutor {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Spawn the executor's drain task on the current runtime
    pub fn spawn(name: impl Into<String>) -> Arc<Self> {
        Self::spawn_on(&Handle::current(), name)
    }

    /// Spawn the executor's drain task on `handle`
    pub fn spawn_on(handle: &Handle, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let task_name = name.clone();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            trace!(executor = %task_name, "serial executor stopped");
        });

        Arc::new(Self { name, tx })
    }

    /// Executor name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Affinity for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!(executor = %self.name, "serial executor is gone, job dropped");
        }
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor").field("name", &self.name).finish()
    }
}

/// Spawns every job as its own runtime task.
///
/// Used for owners that have not been bound to anything more specific.
#[derive(Debug, Clone)]
pub struct RuntimeAffinity {
    handle: Handle,
}

impl RuntimeAffinity {
    /// Affinity for the current runtime. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// Affinity for a specific runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Affinity for RuntimeAffinity {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

/// Runs jobs on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineAffinity;

impl Affinity for InlineAffinity {
    fn execute(&self, job: Job) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_serial_executor_preserves_order() {
        let executor = SerialExecutor::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            executor.execute(Box::new(move || seen.lock().push(i)));
        }

        let (tx, rx) = oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.await.unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_runtime_affinity_runs_job() {
        let (tx, rx) = oneshot::channel();
        RuntimeAffinity::current().execute(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn test_inline_affinity_runs_immediately() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        InlineAffinity.execute(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
    }
}
