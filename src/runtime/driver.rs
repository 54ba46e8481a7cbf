//! Reaching a loop from other threads.
//!
//! [`LoopHandle`] is the `Send + Sync` face of an [`EventThread`]: it can
//! queue callbacks, stop or pause the loop, and block the calling thread on
//! a computation run by the loop. [`SpawnedLoop`] owns a loop running on a
//! dedicated OS thread, for programs whose main thread does something else.

use crate::error::{Error, Result};
use crate::runtime::core::EventThread;
use crate::runtime::pause::{self, PauseGuard};
use crate::runtime::shared::Shared;
use crate::task::TaskId;

use futures::future::LocalBoxFuture;
use log::warn;
use parking_lot::Mutex;
use scarlet_executor::panic_message;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Thread-safe handle to an [`EventThread`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queues `callback` to run on the loop and wakes the loop if it is
    /// blocked polling. Callbacks submitted from one thread run in
    /// submission order.
    ///
    /// # Returns
    /// `false` if the loop is closed; the callback is dropped.
    pub fn schedule_now_threadsafe(&self, callback: impl FnOnce(&EventThread) + Send + 'static) -> bool {
        self.shared.submit(Box::new(callback))
    }

    /// Asks the loop to stop after its current tick. Idempotent.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    /// Whether the calling thread is the one the loop belongs to.
    pub fn is_loop_thread(&self) -> bool {
        self.shared.on_loop_thread()
    }

    /// Blocks until the loop reaches a safe point between two ticks and
    /// keeps it there until the guard is dropped.
    ///
    /// # Errors
    /// `InvalidState` on the loop thread or when the loop is not running,
    /// `Timeout` if the loop did not pause within `timeout`.
    pub fn pause(&self, timeout: Option<Duration>) -> Result<PauseGuard> {
        pause::pause(&self.shared, timeout)
    }

    /// Runs a computation on the loop and blocks the calling thread until it
    /// finishes.
    ///
    /// `make` is sent to the loop thread and builds the computation there,
    /// so the computation itself does not need to be `Send`. It runs as a
    /// [`Task`](crate::Task).
    ///
    /// # Arguments
    /// * `make` - Builds the computation on the loop thread
    /// * `timeout` - Maximum time to block; the task is cancelled when it
    ///   elapses
    ///
    /// # Errors
    /// The computation's own error, `Timeout` when `timeout` elapsed,
    /// `Cancelled` if the loop dropped the computation, `InvalidState` when
    /// called on the loop thread or after the loop closed.
    ///
    /// # Example
    /// ```ignore
    /// let spawned = EventThread::builder().spawn()?;
    /// let answer = spawned.handle().run_blocking(
    ///     |lp| {
    ///         let nap = sleep(lp, Duration::from_millis(5));
    ///         Box::pin(async move {
    ///             nap.await?;
    ///             Ok(42)
    ///         })
    ///     },
    ///     None,
    /// )?;
    /// ```
    pub fn run_blocking<T, M>(&self, make: M, timeout: Option<Duration>) -> Result<T>
    where
        T: Send + 'static,
        M: FnOnce(&EventThread) -> LocalBoxFuture<'static, Result<T>> + Send + 'static,
    {
        if self.shared.on_loop_thread() {
            return Err(Error::InvalidState("run_blocking called on the event loop thread"));
        }

        let (tx, rx) = mpsc::sync_channel::<Result<T>>(1);
        let spawned: Arc<Mutex<Option<TaskId>>> = Arc::new(Mutex::new(None));

        let slot = spawned.clone();
        let submitted = self.schedule_now_threadsafe(move |lp| {
            let task = lp.spawn(make(lp));
            *slot.lock() = Some(task.id());
            task.add_done_callback(move |done| {
                let _ = tx.send(done.take_result());
            });
        });

        if !submitted {
            return Err(Error::InvalidState("event loop is closed"));
        }

        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Queued behind the spawn, so the id is known by the time this runs.
                self.schedule_now_threadsafe(move |lp| {
                    let id = *spawned.lock();
                    if let Some(id) = id {
                        lp.cancel_task(id);
                    }
                });
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A loop running forever on its own OS thread.
pub struct SpawnedLoop {
    handle: LoopHandle,
    thread: JoinHandle<Result<()>>,
}

impl SpawnedLoop {
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Waits for the loop thread to exit. The loop exits once stopped.
    ///
    /// # Errors
    /// The error that ended `run_forever`, or `Panic` if the thread panicked.
    pub fn join(self) -> Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(payload) => Err(Error::Panic(panic_message(&*payload))),
        }
    }

    /// Stops the loop and waits for its thread.
    pub fn stop_and_join(self) -> Result<()> {
        self.handle.stop();
        self.join()
    }
}

/// Starts a thread that builds a loop with `build`, runs it until stopped and
/// closes it.
pub(crate) fn spawn<B>(name: Option<String>, build: B) -> io::Result<SpawnedLoop>
where
    B: FnOnce() -> io::Result<EventThread> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<io::Result<LoopHandle>>(1);

    let mut builder = thread::Builder::new();
    if let Some(name) = name {
        builder = builder.name(name);
    }

    let thread = builder.spawn(move || -> Result<()> {
        let lp = match build() {
            Ok(lp) => lp,
            Err(err) => {
                let _ = tx.send(Err(err));
                return Ok(());
            }
        };

        let _ = tx.send(Ok(lp.handle()));
        let result = lp.run_forever();

        if let Err(err) = lp.close() {
            warn!("failed to close event loop: {}", err);
        }
        result
    })?;

    match rx.recv() {
        Ok(Ok(handle)) => Ok(SpawnedLoop { handle, thread }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => Err(io::Error::other("event loop thread exited during startup")),
    }
}
