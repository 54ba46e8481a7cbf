//! Free / busy / claimed bookkeeping for worker threads.
//!
//! The pool is not thread-safe on purpose: exactly one thread (the event
//! loop) checks workers out and back in. Only the per-worker job queues are
//! shared with the worker threads.

use crate::builder::Builder;
use crate::job::Job;
use crate::worker::{WorkerId, WorkerThread};

use log::debug;
use std::collections::HashMap;
use std::io;

/// A growable set of [`WorkerThread`]s.
///
/// There is no upper bound on the number of workers: [`Pool::checkout`]
/// spawns a new thread whenever no idle one is available. When work is done
/// [`Pool::checkin`] keeps at most `min_kept` idle workers and tears the
/// others down.
#[derive(Debug)]
pub struct Pool {
    free: Vec<WorkerThread>,
    busy: HashMap<WorkerId, WorkerThread>,
    claimed: HashMap<WorkerId, WorkerThread>,
    min_kept: usize,
    name_prefix: String,
    stack_size: Option<usize>,
    next_id: u64,
}

impl Pool {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn new(builder: Builder) -> Self {
        Self {
            free: Vec::new(),
            busy: HashMap::new(),
            claimed: HashMap::new(),
            min_kept: builder.min_kept,
            name_prefix: builder.name_prefix,
            stack_size: builder.stack_size,
            next_id: 0,
        }
    }

    /// Takes an idle worker, or spawns one, and marks it busy.
    pub fn checkout(&mut self) -> io::Result<WorkerId> {
        let worker = self.take_idle()?;
        let id = worker.id();
        self.busy.insert(id, worker);

        Ok(id)
    }

    /// Like [`Pool::checkout`] but reserves the worker for one caller until it
    /// is checked back in. Claimed workers are never handed to anyone else.
    pub fn claim(&mut self) -> io::Result<WorkerId> {
        let worker = self.take_idle()?;
        let id = worker.id();
        self.claimed.insert(id, worker);

        Ok(id)
    }

    /// Queues a job on a checked-out or claimed worker.
    ///
    /// Hands the job back if `id` is not checked out.
    pub fn submit(&self, id: WorkerId, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        match self.worker(id) {
            Some(worker) => {
                worker.submit(job);
                Ok(())
            }
            None => Err(job),
        }
    }

    /// Returns a checked-out or claimed worker.
    pub fn worker(&self, id: WorkerId) -> Option<&WorkerThread> {
        self.busy.get(&id).or_else(|| self.claimed.get(&id))
    }

    /// Returns a worker to the idle set, or tears it down if enough workers
    /// are idle already. Returns `false` if `id` was not checked out.
    pub fn checkin(&mut self, id: WorkerId) -> bool {
        let worker = match self.busy.remove(&id).or_else(|| self.claimed.remove(&id)) {
            Some(worker) => worker,
            None => return false,
        };

        if self.free.len() < self.min_kept {
            self.free.push(worker);
        } else {
            debug!("tearing down idle {}", id);
            drop(worker);
        }

        true
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    pub fn min_kept(&self) -> usize {
        self.min_kept
    }

    /// Stops every worker. Queued jobs are cancelled; running jobs finish on
    /// their own. Does not wait for the threads.
    pub fn shutdown(&mut self) {
        let total = self.free.len() + self.busy.len() + self.claimed.len();
        if total > 0 {
            debug!("shutting down {} worker(s)", total);
        }

        for mut worker in self
            .free
            .drain(..)
            .chain(self.busy.drain().map(|(_, w)| w))
            .chain(self.claimed.drain().map(|(_, w)| w))
        {
            worker.stop();
        }
    }

    fn take_idle(&mut self) -> io::Result<WorkerThread> {
        if let Some(worker) = self.free.pop() {
            return Ok(worker);
        }

        let id = WorkerId(self.next_id);
        self.next_id += 1;

        let name = format!("{}-{}", self.name_prefix, id.0);
        WorkerThread::spawn(id, name, self.stack_size)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FnJob;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_checkout_spawns_then_reuses() {
        let mut pool = Pool::builder().min_kept(1).build();

        let first = pool.checkout().unwrap();
        assert_eq!(pool.busy_count(), 1);
        assert!(pool.checkin(first));
        assert_eq!(pool.free_count(), 1);

        let second = pool.checkout().unwrap();
        assert_eq!(first, second, "idle worker should be reused");
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_checkin_tears_down_beyond_min_kept() {
        let mut pool = Pool::builder().min_kept(1).build();

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a, b);

        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_claimed_workers_are_not_handed_out() {
        let mut pool = Pool::builder().min_kept(2).build();

        let claimed = pool.claim().unwrap();
        let other = pool.checkout().unwrap();
        assert_ne!(claimed, other);
        assert_eq!(pool.claimed_count(), 1);

        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            assert!(pool
                .submit(claimed, FnJob::new(move || tx.send(i).unwrap()))
                .is_ok());
        }
        let seen: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2]);

        assert!(pool.checkin(claimed));
        assert_eq!(pool.claimed_count(), 0);
    }

    #[test]
    fn test_submit_to_unknown_worker_returns_job() {
        let mut pool = Pool::builder().build();
        let id = pool.checkout().unwrap();
        pool.checkin(id);

        assert!(pool.submit(id, FnJob::new(|| {})).is_err());
        assert!(!pool.checkin(id));
    }
}
