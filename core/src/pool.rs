//! Bounded worker pool for independent work inside one simulation year.
//!
//! RULE: Work never crosses a year boundary. Every call returns only after
//! all of its work has finished.
//! RULE: Output order equals input order, whatever the thread count.

use crate::error::{SimError, SimResult};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// A rayon pool sized to the run's thread budget. One thread means no pool:
/// work runs inline on the caller.
pub struct WorkerPool {
    pool: Option<ThreadPool>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> SimResult<Self> {
        if threads <= 1 {
            return Ok(Self::sequential());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sim-worker-{i}"))
            .build()
            .map_err(|e| SimError::Configuration(format!("cannot start {threads} workers: {e}")))?;
        log::debug!("pool: started {threads} workers");
        Ok(Self { pool: Some(pool) })
    }

    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(1, ThreadPool::current_num_threads)
    }

    /// Map `f` over `items`. Results come back in input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| items.par_iter().map(f).collect()),
            None => items.iter().map(f).collect(),
        }
    }

    /// Run two independent closures, concurrently when the pool has workers.
    pub fn join<A, B, FA, FB>(&self, fa: FA, fb: FB) -> (A, B)
    where
        A: Send,
        B: Send,
        FA: FnOnce() -> A + Send,
        FB: FnOnce() -> B + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| rayon::join(fa, fb)),
            None => (fa(), fb()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_order_is_independent_of_thread_count() {
        let items: Vec<u64> = (0..103).collect();
        let one = WorkerPool::sequential().map(&items, |x| x * x);
        let four = WorkerPool::new(4).unwrap().map(&items, |x| x * x);
        let many = WorkerPool::new(16).unwrap().map(&items, |x| x * x);
        assert_eq!(one, four);
        assert_eq!(one, many);
    }

    #[test]
    fn join_returns_both_sides() {
        assert_eq!(WorkerPool::new(2).unwrap().join(|| 1, || "b"), (1, "b"));
        assert_eq!(WorkerPool::sequential().join(|| 1, || "b"), (1, "b"));
    }

    #[test]
    fn one_thread_runs_inline() {
        assert_eq!(WorkerPool::new(1).unwrap().threads(), 1);
        assert_eq!(WorkerPool::new(3).unwrap().threads(), 3);
    }
}
