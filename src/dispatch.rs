//! Scatter-write worker pool
//!
//! Scatter writes are dispatched as independent jobs to a small pool of
//! worker threads and complete out of order. Each job reports exactly one
//! completion through the closure it carries. With zero workers the pool
//! runs jobs inline on the submitting thread, which callers use for
//! deterministic single-threaded operation.

use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of scatter-write workers
pub struct ScatterPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ScatterPool {
    /// Spawn a pool with the given number of workers; zero means inline
    pub fn new(workers: usize) -> Self {
        if workers == 0 {
            return Self { tx: None, workers: Vec::new() };
        }

        let (tx, rx) = unbounded::<Job>();
        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("dblwr-io-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn scatter-write worker")
            })
            .collect();

        Self { tx: Some(tx), workers: handles }
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Run a job on the pool, or inline when the pool has no workers
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.tx {
            Some(tx) => {
                // The receiver outlives the sender; send only fails after
                // shutdown has begun, and no jobs are submitted then.
                let _ = tx.send(Box::new(job));
            }
            None => job(),
        }
    }
}

impl Drop for ScatterPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain its remaining jobs
        // and exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_jobs_run_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ScatterPool::new(4);

        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_inline_mode() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ScatterPool::new(0);

        let c = counter.clone();
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // Inline jobs complete before execute returns.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
