//! OS worker thread with a private FIFO of jobs.
//!
//! The queue is the only structure touched from two threads: the owner pushes,
//! the worker pops. It is a plain `VecDeque` behind a mutex with a condition
//! variable to park the worker while the queue is empty.

use crate::job::Job;
use crate::panic_message;

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Identifier of a worker inside its [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

struct QueueState {
    jobs: VecDeque<Box<dyn Job>>,
    closed: bool,
}

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends a job. Hands the job back if the queue is already closed.
    fn push(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(job);
        }

        state.jobs.push_back(job);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a job is available. Returns `None` once the queue is closed.
    fn pop(&self) -> Option<Box<dyn Job>> {
        let mut state = self.state.lock();

        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }

            if state.closed {
                return None;
            }

            self.available.wait(&mut state);
        }
    }

    /// Closes the queue and returns the jobs nobody will run.
    fn close(&self) -> Vec<Box<dyn Job>> {
        let mut state = self.state.lock();
        state.closed = true;
        let orphans = state.jobs.drain(..).collect();
        drop(state);

        self.available.notify_all();
        orphans
    }

    fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// An OS thread that runs submitted jobs strictly in submission order.
///
/// A job that panics is reported through `log::error!` and the worker goes on
/// with the next job. Stopping the worker cancels every job still queued; the
/// job currently running, if any, is allowed to finish.
pub struct WorkerThread {
    id: WorkerId,
    name: String,
    queue: Arc<WorkQueue>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns a new worker thread.
    ///
    /// # Arguments
    /// * `id` - Identifier reported in logs
    /// * `name` - OS thread name
    /// * `stack_size` - Optional stack size for the OS thread
    pub fn spawn(id: WorkerId, name: String, stack_size: Option<usize>) -> io::Result<Self> {
        let queue = Arc::new(WorkQueue::new());

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let worker_queue = queue.clone();
        let worker_name = name.clone();
        let handle = builder.spawn(move || run(worker_name, worker_queue))?;

        debug!("spawned {} ({})", id, name);

        Ok(Self {
            id,
            name,
            queue,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job behind every job submitted before it.
    ///
    /// If the worker has been stopped the job is cancelled right away.
    pub fn submit(&self, job: Box<dyn Job>) {
        if let Err(job) = self.queue.push(job) {
            trace!("{} is stopped, cancelling job", self.id);
            job.cancel();
        }
    }

    /// Number of jobs waiting behind the one currently running.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.is_closed()
    }

    /// Asks the thread to exit once its current job is done and cancels the
    /// jobs still queued. Does not wait for the thread.
    pub fn stop(&mut self) {
        let orphans = self.queue.close();
        if !orphans.is_empty() {
            debug!("{} stopping, cancelling {} queued job(s)", self.id, orphans.len());
        }

        for job in orphans {
            job.cancel();
        }
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn join(mut self) -> thread::Result<()> {
        self.stop();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(name: String, queue: Arc<WorkQueue>) {
    while let Some(job) = queue.pop() {
        if job.is_abandoned() {
            trace!("{}: skipping abandoned job", name);
            job.cancel();
            continue;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            error!("{}: job panicked: {}", name, panic_message(payload.as_ref()));
        }
    }

    debug!("{}: exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FnJob;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = WorkerThread::spawn(WorkerId(0), "order".into(), None).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            worker.submit(FnJob::new(move || tx.send(i).unwrap()));
        }

        let seen: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        worker.join().unwrap();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let worker = WorkerThread::spawn(WorkerId(1), "panics".into(), None).unwrap();
        let (tx, rx) = mpsc::channel();

        worker.submit(FnJob::new(|| panic!("boom")));
        worker.submit(FnJob::new(move || tx.send("still alive").unwrap()));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "still alive"
        );
        worker.join().unwrap();
    }

    struct Flagged {
        abandoned: bool,
        outcome: mpsc::Sender<&'static str>,
    }

    impl Job for Flagged {
        fn is_abandoned(&self) -> bool {
            self.abandoned
        }

        fn run(self: Box<Self>) {
            self.outcome.send("ran").unwrap();
        }

        fn cancel(self: Box<Self>) {
            self.outcome.send("cancelled").unwrap();
        }
    }

    #[test]
    fn test_abandoned_job_is_cancelled_not_run() {
        let worker = WorkerThread::spawn(WorkerId(2), "abandon".into(), None).unwrap();
        let (tx, rx) = mpsc::channel();

        worker.submit(Box::new(Flagged {
            abandoned: true,
            outcome: tx.clone(),
        }));
        worker.submit(Box::new(Flagged {
            abandoned: false,
            outcome: tx,
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "cancelled");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
        worker.join().unwrap();
    }

    #[test]
    fn test_stop_cancels_queued_jobs() {
        let mut worker = WorkerThread::spawn(WorkerId(3), "stop".into(), None).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();

        // Hold the worker busy so the next job stays queued.
        worker.submit(FnJob::new(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        }));
        worker.submit(Box::new(Flagged {
            abandoned: false,
            outcome: tx.clone(),
        }));

        worker.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "cancelled");

        worker.submit(Box::new(Flagged {
            abandoned: false,
            outcome: tx,
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "cancelled");

        let _ = gate_tx.send(());
        worker.join().unwrap();
    }
}
