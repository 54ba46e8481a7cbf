//! The event loop.
//!
//! [`EventThread`] owns a FIFO ready queue, a timer heap and the readiness
//! reactor, and runs them one tick at a time:
//!
//! 1. pull in callbacks submitted from other threads and woken tasks
//! 2. promote expired timers into the ready queue
//! 3. poll the reactor, without blocking if anything is ready
//! 4. run exactly the handles queued at that point
//!
//! Handles scheduled while step 4 runs wait for the next tick, so one busy
//! callback chain cannot starve timers or I/O.

use crate::builder::{Config, EventThreadBuilder};
use crate::error::{Error, Result};
use crate::executor::ExecutorState;
use crate::reactor::core::Reactor;
use crate::reactor::event::Direction;
use crate::reactor::is_resource_exhausted;
use crate::reactor::notify::Notifier;
use crate::runtime::driver::LoopHandle;
use crate::runtime::handle::{Callback, Handle, TimerHandle};
use crate::runtime::queue::{ReadyQueue, TimerHeap};
use crate::runtime::shared::Shared;
use crate::task::{TaskCtl, TaskId};

use log::{debug, error, trace, warn};
use scarlet_executor::panic_message;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct Inner {
    pub(crate) shared: Arc<Shared>,
    ready: RefCell<ReadyQueue>,
    timers: RefCell<TimerHeap>,
    reactor: RefCell<Reactor>,
    tasks: RefCell<HashMap<TaskId, Rc<dyn TaskCtl>>>,
    next_task: Cell<u64>,
    pub(crate) current_task: RefCell<Option<Rc<dyn TaskCtl>>>,
    pub(crate) executor: RefCell<ExecutorState>,
    exception_handler: Box<dyn Fn(&str)>,
    name: Option<String>,
    debug: bool,
    fd_retry_delay: Duration,
    retry_at: Cell<Option<Instant>>,
}

/// A single-threaded event loop.
///
/// `EventThread` is a cheap, clonable reference to the loop. It is neither
/// `Send` nor `Sync`: everything it owns is touched only from the thread
/// that built it. Use [`EventThread::handle`] to reach the loop from other
/// threads.
///
/// # Example
/// ```ignore
/// let lp = EventThread::new()?;
/// let sleeper = sleep(&lp, Duration::from_millis(10));
/// lp.run_until_complete(sleeper)?;
/// ```
#[derive(Clone)]
pub struct EventThread {
    pub(crate) inner: Rc<Inner>,
}

/// Non-owning reference to a loop, held by futures, tasks and handles so
/// that none of them keeps the loop alive.
#[derive(Clone)]
pub(crate) struct WeakLoop {
    inner: Weak<Inner>,
}

impl WeakLoop {
    pub(crate) fn upgrade(&self) -> Option<EventThread> {
        self.inner.upgrade().map(|inner| EventThread { inner })
    }

    pub(crate) fn is(&self, lp: &EventThread) -> bool {
        Weak::as_ptr(&self.inner) == Rc::as_ptr(&lp.inner)
    }
}

/// Resets the running flag even if a tick unwinds.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.shared.clear_stop();
        self.shared.set_running(false);
    }
}

impl EventThread {
    /// Creates a loop with the default configuration on the current thread.
    pub fn new() -> io::Result<Self> {
        EventThreadBuilder::new().build()
    }

    pub fn builder() -> EventThreadBuilder {
        EventThreadBuilder::new()
    }

    pub(crate) fn from_config(config: Config) -> io::Result<Self> {
        let notifier = Arc::new(Notifier::new()?);
        let reactor = Reactor::new(config.max_events, notifier.clone())?;
        let shared = Arc::new(Shared::new(notifier));

        let exception_handler: Box<dyn Fn(&str)> = match config.exception_handler {
            Some(handler) => Box::new(move |message: &str| handler(message)),
            None => Box::new(|message: &str| error!("{}", message)),
        };

        let inner = Inner {
            shared,
            ready: RefCell::new(ReadyQueue::new()),
            timers: RefCell::new(TimerHeap::new()),
            reactor: RefCell::new(reactor),
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(1),
            current_task: RefCell::new(None),
            executor: RefCell::new(ExecutorState::new(config.pool)),
            exception_handler,
            name: config.name,
            debug: config.debug,
            fd_retry_delay: config.fd_retry_delay,
            retry_at: Cell::new(None),
        };

        debug!("event loop {} created", inner.name.as_deref().unwrap_or("<unnamed>"));
        Ok(Self { inner: Rc::new(inner) })
    }

    /// Returns a thread-safe handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.inner.shared.clone())
    }

    pub(crate) fn downgrade(&self) -> WeakLoop {
        WeakLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &EventThread) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The loop's clock. Deadlines passed to [`EventThread::schedule_at`]
    /// are compared against it.
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Whether debug diagnostics (retrieved state, task spawn sites) are on.
    pub fn is_debug(&self) -> bool {
        self.inner.debug
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Queues `callback` to run on the next tick, behind everything queued
    /// before it.
    ///
    /// # Returns
    /// The handle to cancel the callback with, or `None` if the loop is
    /// closed and the callback was dropped.
    pub fn schedule_now(&self, callback: impl FnOnce() + 'static) -> Option<Handle> {
        if self.is_closed() {
            return None;
        }

        let handle = Handle::once(callback);
        self.inner.ready.borrow_mut().push(handle.clone());
        Some(handle)
    }

    /// Runs `callback` once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.schedule_at(self.time() + delay, callback)
    }

    /// Runs `callback` at `when`, or on the next tick if `when` has passed.
    ///
    /// Timers with the same deadline fire in the order they were scheduled.
    pub fn schedule_at(&self, when: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let timer = self.inner.timers.borrow_mut().push(when, Handle::once(callback));
        if self.is_closed() {
            timer.cancel();
        }
        timer
    }

    /// Queues `callback` from any thread. See [`LoopHandle::schedule_now_threadsafe`].
    pub fn schedule_now_threadsafe(&self, callback: impl FnOnce(&EventThread) + Send + 'static) -> bool {
        self.inner.shared.submit(Box::new(callback))
    }

    /// Runs `callback` every time `fd` is readable, until deregistered.
    ///
    /// A previous read callback for `fd` is cancelled and replaced; a write
    /// callback for the same descriptor is kept.
    pub fn register_read_interest(&self, fd: RawFd, callback: impl Fn() + 'static) -> io::Result<Handle> {
        self.register_interest(fd, Direction::Read, callback)
    }

    /// Runs `callback` every time `fd` is writable, until deregistered.
    pub fn register_write_interest(&self, fd: RawFd, callback: impl Fn() + 'static) -> io::Result<Handle> {
        self.register_interest(fd, Direction::Write, callback)
    }

    /// Removes and cancels the read callback of `fd`. Returns whether one
    /// was registered.
    pub fn deregister_read_interest(&self, fd: RawFd) -> bool {
        self.deregister_interest(fd, Direction::Read)
    }

    /// Removes and cancels the write callback of `fd`. Returns whether one
    /// was registered.
    pub fn deregister_write_interest(&self, fd: RawFd) -> bool {
        self.deregister_interest(fd, Direction::Write)
    }

    pub(crate) fn register_interest(
        &self,
        fd: RawFd,
        direction: Direction,
        callback: impl Fn() + 'static,
    ) -> io::Result<Handle> {
        if self.is_closed() {
            return Err(io::Error::other("event loop is closed"));
        }

        let handle = Handle::new(Callback::Repeat(Rc::new(callback)));
        let previous = self
            .inner
            .reactor
            .borrow_mut()
            .register(fd, direction, handle.clone())?;

        if let Some(previous) = previous {
            previous.cancel();
        }

        Ok(handle)
    }

    pub(crate) fn deregister_interest(&self, fd: RawFd, direction: Direction) -> bool {
        let removed = self.inner.reactor.borrow_mut().deregister(fd, direction);
        match removed {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Deregisters `handle` only if it is still the one registered.
    pub(crate) fn deregister_handle(&self, fd: RawFd, direction: Direction, handle: &Handle) -> bool {
        let removed = self.inner.reactor.borrow_mut().deregister_handle(fd, direction, handle);
        match removed {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Asks the loop to return from [`EventThread::run_forever`] after the
    /// current tick. Idempotent.
    pub fn stop(&self) {
        self.inner.shared.request_stop();
    }

    /// Runs ticks until [`EventThread::stop`] is called.
    ///
    /// A stop requested before the call makes the loop run one tick.
    ///
    /// # Errors
    /// `InvalidState` if the loop is closed or already running, `Io` if the
    /// multiplexer fails with a non-recoverable error.
    pub fn run_forever(&self) -> Result<()> {
        let _guard = self.enter_run()?;
        debug!("event loop running");

        loop {
            self.tick()?;
            if self.inner.shared.stop_requested() {
                break;
            }
        }

        debug!("event loop stopped");
        Ok(())
    }

    /// Runs a single tick. Blocks in the poll only when nothing is ready and
    /// a timer is pending, or forever when nothing at all is scheduled.
    pub fn run_once(&self) -> Result<()> {
        let _guard = self.enter_run()?;
        self.tick()
    }

    /// Drives `computation` to completion and returns its result.
    ///
    /// The computation is wrapped in a [`Task`](crate::Task) unless it
    /// already is a future of this loop. The loop stops when it finishes.
    ///
    /// # Example
    /// ```ignore
    /// let lp = EventThread::new()?;
    /// let answer = lp.run_until_complete(async { Ok(42) })?;
    /// assert_eq!(answer, 42);
    /// ```
    pub fn run_until_complete<T, F>(&self, computation: F) -> Result<T>
    where
        T: 'static,
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        let future = self.ensure_future(computation)?;
        let handle = self.handle();
        future.add_done_callback(move |_| handle.stop());

        self.run_forever()?;

        if !future.done() {
            return Err(Error::InvalidState("event loop stopped before the future completed"));
        }
        future.take_result()
    }

    /// Shuts the loop down for good.
    ///
    /// Every live task is cancelled, queued handles and timers are dropped,
    /// readiness registrations are removed and the executor pool is shut
    /// down. Idempotent.
    ///
    /// # Errors
    /// `InvalidState` when called while the loop is running.
    pub fn close(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::InvalidState("cannot close a running event loop"));
        }
        if self.is_closed() {
            return Ok(());
        }

        debug!("closing event loop");
        self.inner.shared.mark_closed();

        crate::executor::shutdown(self);

        let tasks: Vec<_> = self.inner.tasks.borrow_mut().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.abort();
        }

        let handles = self.inner.ready.borrow_mut().drain();
        for handle in handles {
            handle.cancel();
        }

        let mut timers = mem::replace(&mut *self.inner.timers.borrow_mut(), TimerHeap::new());
        timers.clear();

        let registrations = self.inner.reactor.borrow_mut().clear();
        for handle in registrations {
            handle.cancel();
        }

        let dropped = self.inner.shared.discard_pending();
        if dropped > 0 {
            debug!("dropped {} callback(s) submitted from other threads", dropped);
        }

        Ok(())
    }

    /// Number of tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        TaskId(id)
    }

    pub(crate) fn register_task(&self, task: Rc<dyn TaskCtl>) {
        self.inner.tasks.borrow_mut().insert(task.id(), task);
    }

    pub(crate) fn unregister_task(&self, id: TaskId) {
        let task = self.inner.tasks.borrow_mut().remove(&id);
        drop(task);
    }

    /// Cancels a live task by id. Used by threadsafe entry points that cannot
    /// hold the task itself.
    pub(crate) fn cancel_task(&self, id: TaskId) -> bool {
        let task = self.inner.tasks.borrow().get(&id).cloned();
        task.is_some_and(|task| task.cancel_task())
    }

    /// Hands a failure message to the exception handler.
    pub(crate) fn report(&self, message: &str) {
        if panic::catch_unwind(AssertUnwindSafe(|| (self.inner.exception_handler)(message))).is_err() {
            error!("exception handler panicked while reporting: {}", message);
        }
    }

    fn enter_run(&self) -> Result<RunGuard<'_>> {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return Err(Error::InvalidState("event loop is closed"));
        }
        if shared.is_running() {
            return Err(Error::InvalidState("event loop is already running"));
        }
        if !shared.on_loop_thread() {
            return Err(Error::InvalidState("event loop driven from a foreign thread"));
        }

        shared.set_running(true);
        Ok(RunGuard { shared })
    }

    fn tick(&self) -> Result<()> {
        self.inner.shared.pause.checkpoint();

        self.drain_remote();
        self.promote_timers();

        let timeout = self.poll_timeout();
        self.poll_reactor(timeout)?;

        self.drain_remote();
        self.promote_timers();

        self.run_ready();
        Ok(())
    }

    fn drain_remote(&self) {
        let shared = &self.inner.shared;

        while let Some(remote) = shared.pop_remote() {
            let lp = self.downgrade();
            self.inner.ready.borrow_mut().push(Handle::once(move || {
                if let Some(lp) = lp.upgrade() {
                    remote(&lp);
                }
            }));
        }

        while let Some(id) = shared.pop_woken() {
            let task = self.inner.tasks.borrow().get(&id).cloned();
            match task {
                Some(task) => task.schedule(),
                None => trace!("ignoring wake of finished {}", id),
            }
        }
    }

    fn promote_timers(&self) {
        let now = Instant::now();
        let moved = self
            .inner
            .timers
            .borrow_mut()
            .pop_expired(now, &mut self.inner.ready.borrow_mut());

        if moved > 0 {
            trace!("{} timer(s) expired", moved);
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let shared = &self.inner.shared;
        if !self.inner.ready.borrow().is_empty() || shared.has_pending() || shared.stop_requested() {
            return Some(Duration::ZERO);
        }

        let now = Instant::now();
        let next = self.inner.timers.borrow_mut().next_deadline();
        next.map(|when| when.saturating_duration_since(now))
    }

    fn poll_reactor(&self, timeout: Option<Duration>) -> Result<()> {
        if let Some(retry_at) = self.inner.retry_at.get() {
            let now = Instant::now();
            if now < retry_at {
                let backoff = retry_at - now;
                let wait = timeout.map_or(backoff, |timeout| timeout.min(backoff));
                self.inner.reactor.borrow_mut().wait_notified(Some(wait))?;
                return Ok(());
            }
            self.inner.retry_at.set(None);
        }

        let polled = self
            .inner
            .reactor
            .borrow_mut()
            .poll(timeout, &mut self.inner.ready.borrow_mut());

        match polled {
            Ok(_) => Ok(()),
            Err(err) if is_resource_exhausted(&err) => {
                warn!(
                    "readiness poll failed ({}), retrying in {:?}",
                    err, self.inner.fd_retry_delay
                );
                self.inner.retry_at.set(Some(Instant::now() + self.inner.fd_retry_delay));
                Ok(())
            }
            Err(err) => Err(Error::from(err)),
        }
    }

    fn run_ready(&self) {
        let count = self.inner.ready.borrow().len();

        for _ in 0..count {
            let next = self.inner.ready.borrow_mut().pop();
            let handle = match next {
                Some(handle) => handle,
                None => break,
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handle.run())) {
                self.report(&format!("exception in callback: {}", panic_message(&*payload)));
            }
        }
    }
}

impl fmt::Debug for EventThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventThread")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .field("ready", &self.inner.ready.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .field("tasks", &self.inner.tasks.borrow().len())
            .finish()
    }
}
