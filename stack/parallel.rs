//! Worker pool shared by the fold-parallel phases.
//!
//! Every phase that fans out independent fits (cross-validation folds of the
//! blend, held-out prediction folds, member refits) goes through
//! [`WorkerPool::map_join`], which returns only after every task finished.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to build the worker thread pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
    #[error("The worker pool needs at least one thread.")]
    ZeroThreads,
}

#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Builds a pool with `threads` workers, or one per logical CPU.
    pub fn new(threads: Option<usize>) -> Result<Self, PoolError> {
        let threads = threads.unwrap_or_else(num_cpus::get);
        if threads == 0 {
            return Err(PoolError::ZeroThreads);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stacks-worker-{i}"))
            .build()?;
        log::debug!("Worker pool started with {threads} threads");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `task` on every item and joins. Results keep the input order.
    pub fn map_join<T, R, F>(&self, items: &[T], task: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(&task).collect())
    }
}
