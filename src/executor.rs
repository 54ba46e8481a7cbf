//! Blocking work handed to worker threads.
//!
//! The loop owns a [`Pool`] from `scarlet-executor` and is the only thread
//! that checks workers in and out. A submitted callable travels to a worker
//! as a [`Job`]; its outcome comes back through the loop's inbox and is
//! applied to the caller's [`Future`] on the loop thread. Workers never
//! touch loop state.
//!
//! ```ignore
//! let size = lp.run_in_executor(|| std::fs::metadata("Cargo.toml").map(|m| m.len()));
//! let size = lp.run_until_complete(size)?;
//! ```

use crate::error::{Error, Result};
use crate::future::Future;
use crate::runtime::core::EventThread;
use crate::runtime::shared::Shared;

use log::{debug, error, trace};
use scarlet_executor::{Builder, Job, Pool, WorkerId, panic_message};
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Payload = Box<dyn Any + Send>;
type Deliver = Box<dyn FnOnce(Option<Payload>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct JobId(u64);

struct PendingJob {
    worker: WorkerId,
    deliver: Deliver,
}

#[derive(Debug, Default)]
struct Claim {
    outstanding: usize,
    released: bool,
}

/// Loop-side bookkeeping for blocking jobs.
pub(crate) struct ExecutorState {
    pool: Pool,
    pending: HashMap<JobId, PendingJob>,
    claims: HashMap<WorkerId, Claim>,
    next_job: u64,
}

impl ExecutorState {
    pub(crate) fn new(builder: Builder) -> Self {
        Self {
            pool: builder.build(),
            pending: HashMap::new(),
            claims: HashMap::new(),
            next_job: 0,
        }
    }

    fn next_id(&mut self) -> JobId {
        let id = JobId(self.next_job);
        self.next_job += 1;
        id
    }

    /// A job on `worker` delivered its outcome.
    fn job_done(&mut self, worker: WorkerId) {
        match self.claims.get_mut(&worker) {
            Some(claim) => {
                claim.outstanding = claim.outstanding.saturating_sub(1);
                if claim.released && claim.outstanding == 0 {
                    self.claims.remove(&worker);
                    self.pool.checkin(worker);
                }
            }
            None => {
                self.pool.checkin(worker);
            }
        }
    }

    fn release_claim(&mut self, worker: WorkerId) {
        let idle = match self.claims.get_mut(&worker) {
            Some(claim) => {
                claim.released = true;
                claim.outstanding == 0
            }
            None => return,
        };

        if idle {
            self.claims.remove(&worker);
            self.pool.checkin(worker);
        }
    }
}

impl fmt::Debug for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorState")
            .field("pool", &self.pool)
            .field("pending", &self.pending.len())
            .field("claims", &self.claims.len())
            .finish()
    }
}

struct LoopJob<F> {
    id: JobId,
    function: F,
    shared: Arc<Shared>,
    abandoned: Arc<AtomicBool>,
}

impl<F> Job for LoopJob<F>
where
    F: FnOnce() -> Payload + Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn run(self: Box<Self>) {
        let Self { id, function, shared, .. } = *self;
        let payload = function();
        hand_back(&shared, id, Some(payload));
    }

    fn cancel(self: Box<Self>) {
        hand_back(&self.shared, self.id, None);
    }
}

fn hand_back(shared: &Shared, id: JobId, payload: Option<Payload>) {
    let queued = shared.submit(Box::new(move |lp: &EventThread| deliver(lp, id, payload)));
    if !queued {
        trace!("event loop closed, dropping outcome of job {}", id.0);
    }
}

/// Applies a job outcome on the loop thread.
fn deliver(lp: &EventThread, id: JobId, payload: Option<Payload>) {
    let entry = {
        let mut executor = lp.inner.executor.borrow_mut();
        let entry = executor.pending.remove(&id);
        if let Some(entry) = &entry {
            executor.job_done(entry.worker);
        }
        entry
    };

    match entry {
        Some(entry) => (entry.deliver)(payload),
        None => trace!("job {} was already settled", id.0),
    }
}

fn dispatch<T, E, F>(lp: &EventThread, claimed: Option<WorkerId>, callable: F) -> Future<T>
where
    T: Send + 'static,
    E: Into<Error> + 'static,
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
{
    let future = lp.create_future::<T>();
    if lp.is_closed() {
        future.cancel();
        return future;
    }

    let mut executor = lp.inner.executor.borrow_mut();
    let worker = match claimed {
        Some(worker) => worker,
        None => match executor.pool.checkout() {
            Ok(worker) => worker,
            Err(err) => {
                drop(executor);
                error!("could not start an executor worker: {}", err);
                future.set_error_if_pending(err);
                return future;
            }
        },
    };

    let id = executor.next_id();
    let abandoned = Arc::new(AtomicBool::new(false));

    let function = move || -> Payload {
        let outcome: Result<T> = match panic::catch_unwind(AssertUnwindSafe(callable)) {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(payload) => {
                let message = panic_message(&*payload);
                error!("blocking callable panicked: {}", message);
                Err(Error::Panic(message))
            }
        };
        Box::new(outcome)
    };

    let target = future.clone();
    let deliver: Deliver = Box::new(move |payload| match payload {
        Some(payload) => match payload.downcast::<Result<T>>() {
            Ok(outcome) => {
                match *outcome {
                    Ok(value) => target.set_result_if_pending(value),
                    Err(err) => target.set_error_if_pending(err),
                };
            }
            Err(_) => error!("executor job returned an unexpected payload"),
        },
        None => {
            target.cancel();
        }
    });

    executor.pending.insert(id, PendingJob { worker, deliver });
    if let Some(claim) = claimed.and_then(|worker| executor.claims.get_mut(&worker)) {
        claim.outstanding += 1;
    }

    let job = Box::new(LoopJob {
        id,
        function,
        shared: lp.inner.shared.clone(),
        abandoned: abandoned.clone(),
    });
    let rejected = executor.pool.submit(worker, job).err();
    drop(executor);

    if let Some(job) = rejected {
        debug!("{} is no longer checked out, cancelling job {}", worker, id.0);
        job.cancel();
    }

    future.add_done_callback(move |done| {
        if done.cancelled() {
            abandoned.store(true, Ordering::Release);
        }
    });

    future
}

/// Shuts the pool down and cancels the futures of every undelivered job.
/// Called by [`EventThread::close`] once the loop no longer accepts work.
pub(crate) fn shutdown(lp: &EventThread) {
    let pending: Vec<PendingJob> = {
        let mut executor = lp.inner.executor.borrow_mut();
        executor.pool.shutdown();
        executor.claims.clear();
        executor.pending.drain().map(|(_, entry)| entry).collect()
    };

    if !pending.is_empty() {
        debug!("cancelling {} undelivered executor job(s)", pending.len());
    }
    for entry in pending {
        (entry.deliver)(None);
    }
}

/// A worker thread reserved for one caller.
///
/// Everything submitted through [`ClaimedExecutor::run`] executes on the
/// same OS thread, in submission order. The worker returns to the pool once
/// the claim is released and its outstanding jobs are delivered. Dropping
/// the claim releases it.
pub struct ClaimedExecutor {
    lp: EventThread,
    worker: WorkerId,
    released: Cell<bool>,
}

impl ClaimedExecutor {
    /// Queues `callable` on the claimed worker.
    ///
    /// The returned future fails with `InvalidState` once the claim is
    /// released.
    pub fn run<T, E, F>(&self, callable: F) -> Future<T>
    where
        T: Send + 'static,
        E: Into<Error> + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        if self.released.get() {
            let future = self.lp.create_future();
            future.set_error_if_pending(Error::InvalidState("claimed executor was released"));
            return future;
        }

        dispatch(&self.lp, Some(self.worker), callable)
    }

    /// Gives the worker back. Idempotent.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }

        trace!("releasing claimed {}", self.worker);
        self.lp.inner.executor.borrow_mut().release_claim(self.worker);
    }

    pub fn is_released(&self) -> bool {
        self.released.get()
    }
}

impl Drop for ClaimedExecutor {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ClaimedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedExecutor")
            .field("worker", &self.worker)
            .field("released", &self.released.get())
            .finish()
    }
}

impl EventThread {
    /// Runs `callable` on an idle worker thread, spawning one if needed.
    ///
    /// The future resolves with the callable's value or error. A panicking
    /// callable fails it with `Error::Panic`; the worker survives either way.
    /// Cancelling the future before the job starts makes the worker skip it.
    /// On a closed loop the future is cancelled.
    pub fn run_in_executor<T, E, F>(&self, callable: F) -> Future<T>
    where
        T: Send + 'static,
        E: Into<Error> + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        dispatch(self, None, callable)
    }

    /// Reserves a worker thread for a sequence of related blocking calls.
    ///
    /// # Errors
    /// `InvalidState` on a closed loop, `Io` if no thread could be spawned.
    pub fn claim_executor(&self) -> Result<ClaimedExecutor> {
        if self.is_closed() {
            return Err(Error::InvalidState("event loop is closed"));
        }

        let worker = {
            let mut executor = self.inner.executor.borrow_mut();
            let worker = executor.pool.claim()?;
            executor.claims.insert(worker, Claim::default());
            worker
        };

        debug!("claimed {}", worker);
        Ok(ClaimedExecutor {
            lp: self.clone(),
            worker,
            released: Cell::new(false),
        })
    }

    /// Idle executor workers kept alive for reuse.
    pub fn idle_workers(&self) -> usize {
        self.inner.executor.borrow().pool.free_count()
    }

    /// Workers currently running jobs or reserved by a claim.
    pub fn busy_workers(&self) -> usize {
        let executor = self.inner.executor.borrow();
        executor.pool.busy_count() + executor.pool.claimed_count()
    }
}
