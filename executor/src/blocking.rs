//! Loop-independent entry points.
//!
//! `spawn_blocking` lets any async context offload a closure to a worker
//! without going through the event loop; the result comes back on a
//! `futures` oneshot channel.

use crate::job::Job;
use crate::worker::WorkerThread;

use futures::channel::oneshot;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// Blocks the current thread until `future` resolves.
pub fn block_on<F: Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}

struct OneshotJob<F, T> {
    function: F,
    sender: oneshot::Sender<thread::Result<T>>,
}

impl<F, T> Job for OneshotJob<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.sender.is_canceled()
    }

    fn run(self: Box<Self>) {
        let Self { function, sender } = *self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(function));
        let _ = sender.send(outcome);
    }

    fn cancel(self: Box<Self>) {}
}

/// Runs `function` on `worker` and returns a receiver for its outcome.
///
/// The receiver yields `Err(Canceled)` if the worker is stopped before the
/// job runs, and `Ok(Err(payload))` if the closure panicked. Dropping the
/// receiver before the job starts makes the worker skip it.
///
/// # Example
/// ```no_run
/// use scarlet_executor::{WorkerThread, block_on, spawn_blocking};
/// # fn demo(worker: &WorkerThread) {
/// let len = block_on(spawn_blocking(worker, || std::fs::read("Cargo.toml").map(|b| b.len())));
/// # }
/// ```
pub fn spawn_blocking<F, T>(worker: &WorkerThread, function: F) -> oneshot::Receiver<thread::Result<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    worker.submit(Box::new(OneshotJob { function, sender }));

    receiver
}
