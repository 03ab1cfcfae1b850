//! Background tasks and the worker pool that runs them.

use std::cell::Cell;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{BridgeError, Result};

/// A unit of blocking native work.
///
/// The task value moves to a worker thread, so it may only hold `Send` data:
/// shared native handles and plain inputs, never caller-visible wrappers.
/// Whatever [`execute`](BackgroundTask::execute) returns travels back to the
/// host thread, where the submitter turns it into a caller-visible value.
pub trait BackgroundTask: Send + 'static {
    type Output: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run on a worker thread.
    fn execute(self) -> Result<Self::Output>;
}

/// Named pool of worker threads.
pub struct WorkerPool {
    pool: ThreadPool,
    submitted: Cell<u64>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("infer-bridge-worker-{i}"))
            .build()
            .map_err(|e| BridgeError::config(format!("failed to start worker pool: {e}")))?;
        Ok(Self {
            pool,
            submitted: Cell::new(0),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Total jobs handed to the pool so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.submitted.set(self.submitted.get() + 1);
        self.pool.spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_on_named_workers() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);

        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("infer-bridge-worker-"));
        assert_eq!(pool.submitted(), 1);
    }

    #[test]
    fn zero_threads_is_clamped() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.threads(), 1);
    }
}
