//! Tasks: futures driven by a suspended computation.
//!
//! A [`Task`] owns a pinned computation (any `std::future::Future` returning
//! [`Result`]) and resumes it one step at a time on its loop:
//!
//! 1. Creating a task queues its first step; nothing runs synchronously
//! 2. Each step polls the computation once
//! 3. When the computation awaits a scarlet [`Future`], that future's
//!    completion callback runs the next step directly
//! 4. Anything else the computation polls wakes the task through its waker,
//!    which queues a step for the next tick
//! 5. A value finishes the task, an error fails it, `Error::Cancelled`
//!    cancels it
//!
//! # Cancellation
//!
//! [`Task::cancel`] first tries to cancel the future the task is suspended
//! on; the computation then sees `Err(Error::Cancelled)` from its `.await`.
//! Otherwise the request is delivered at the next step: the first scarlet
//! future the computation polls returns `Err(Error::Cancelled)`, and a
//! computation that polls none is dropped.
//!
//! ```ignore
//! let lp = EventThread::new()?;
//! let nap = sleep(&lp, Duration::from_secs(5));
//! let task = lp.spawn(async move {
//!     nap.await?;
//!     Ok("woke up")
//! });
//!
//! task.cancel();
//! assert!(matches!(lp.run_until_complete(task), Err(Error::Cancelled)));
//! ```

use crate::error::{Error, Result};
use crate::future::{Awaited, CancelReason, Driver, Future};
use crate::runtime::core::EventThread;
use crate::runtime::{WeakLoop, context, make_waker};

use futures::future::LocalBoxFuture;
use log::trace;
use scarlet_executor::panic_message;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::future::Future as StdFuture;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Loop-unique task number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task#{}", self.0)
    }
}

/// The type-erased side of a task the loop and its futures talk to.
pub(crate) trait TaskCtl {
    fn id(&self) -> TaskId;

    /// Queues a step unless one is queued already.
    fn schedule(self: Rc<Self>);

    /// Runs a step now. Called from the completion callback of the awaited
    /// future, which already runs from the ready queue.
    fn resume(self: Rc<Self>);

    fn cancel_task(self: Rc<Self>) -> bool;

    /// Drops the computation and cancels the task without resuming it.
    fn abort(&self);

    /// Consumes the cancellation to deliver during the running step.
    fn take_injection(&self) -> bool;

    fn set_awaiting(&self, awaited: Rc<dyn Awaited>);

    fn is_done(&self) -> bool;

    fn frame(&self) -> String;

    fn awaited_task(&self) -> Option<Rc<dyn TaskCtl>>;
}

struct TaskCore<T> {
    id: TaskId,
    name: Option<String>,
    location: Option<&'static Location<'static>>,
    lp: WeakLoop,
    future: Future<T>,
    computation: RefCell<Option<LocalBoxFuture<'static, Result<T>>>>,
    awaiting: RefCell<Option<Rc<dyn Awaited>>>,
    must_cancel: Cell<bool>,
    inject: Cell<bool>,
    scheduled: Cell<bool>,
    reason: Cell<CancelReason>,
    steps: Cell<u64>,
}

/// A [`Future`] driven by a computation.
///
/// Dereferences to the underlying future, so `done()`, `result()`,
/// `add_done_callback()` and friends are available directly. The loop keeps
/// the task alive until it finishes; dropping every `Task` handle does not
/// stop it.
pub struct Task<T> {
    core: Rc<TaskCore<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> Task<T> {
    fn new(
        lp: &EventThread,
        name: Option<String>,
        location: &'static Location<'static>,
        computation: LocalBoxFuture<'static, Result<T>>,
    ) -> Self {
        let core = Rc::new(TaskCore {
            id: lp.next_task_id(),
            name,
            location: lp.is_debug().then_some(location),
            lp: lp.downgrade(),
            future: lp.create_future(),
            computation: RefCell::new(Some(computation)),
            awaiting: RefCell::new(None),
            must_cancel: Cell::new(false),
            inject: Cell::new(false),
            scheduled: Cell::new(false),
            reason: Cell::new(CancelReason::Cancelled),
            steps: Cell::new(0),
        });

        let driver: std::rc::Weak<TaskCore<T>> = Rc::downgrade(&core);
        core.future.set_driver(driver);
        core.future.set_label(core.frame());

        if lp.is_closed() {
            core.abort();
            return Self { core };
        }

        trace!("spawned {}", core.frame());
        lp.register_task(core.clone());
        core.clone().schedule();

        Self { core }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    pub fn future(&self) -> &Future<T> {
        &self.core.future
    }

    pub fn into_future(self) -> Future<T> {
        self.core.future.clone()
    }

    /// Requests cancellation. Returns `false` if the task is already done.
    pub fn cancel(&self) -> bool {
        self.core.clone().cancel_task()
    }

    /// Number of times the computation has been resumed.
    pub fn steps(&self) -> u64 {
        self.core.steps.get()
    }

    /// Describes this task and, transitively, the tasks it is awaiting.
    ///
    /// Each frame reads `Task#<id> '<name>' (spawned at <file:line:col>)`;
    /// the spawn site is only recorded on debug loops.
    ///
    /// # Arguments
    /// * `limit` - Maximum number of frames, `None` for the whole chain
    pub fn get_stack(&self, limit: Option<usize>) -> Vec<String> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut frames = Vec::new();
        let mut seen = HashSet::new();

        let mut next: Option<Rc<dyn TaskCtl>> = Some(self.core.clone());
        while let Some(task) = next {
            if frames.len() >= limit || !seen.insert(task.id()) {
                break;
            }
            frames.push(task.frame());
            next = task.awaited_task();
        }

        frames
    }
}

impl<T> Deref for Task<T> {
    type Target = Future<T>;

    fn deref(&self) -> &Future<T> {
        &self.core.future
    }
}

impl<T: Clone + 'static> StdFuture for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut future = self.core.future.clone();
        Pin::new(&mut future).poll(cx)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("future", &self.core.future)
            .finish()
    }
}

impl<T: 'static> TaskCore<T> {
    fn step(self: &Rc<Self>) {
        let lp = match self.lp.upgrade() {
            Some(lp) => lp,
            None => return,
        };

        let taken = self.computation.borrow_mut().take();
        let mut computation = match taken {
            Some(computation) => computation,
            None => panic!("{} resumed after completion", self.frame()),
        };

        self.awaiting.borrow_mut().take();
        self.steps.set(self.steps.get() + 1);
        self.inject.set(self.must_cancel.replace(false));

        let waker = make_waker(self.id, lp.inner.shared.clone());
        let mut cx = Context::from_waker(&waker);

        let polled = {
            let _scope = context::enter_task(&lp.inner, self.clone());
            panic::catch_unwind(AssertUnwindSafe(|| computation.as_mut().poll(&mut cx)))
        };
        let undelivered = self.inject.replace(false);

        match polled {
            Err(payload) => {
                drop(computation);
                self.finish(Err(Error::Panic(panic_message(&*payload))));
            }
            Ok(Poll::Ready(outcome)) => {
                drop(computation);
                if undelivered || self.must_cancel.get() {
                    self.finish_cancelled();
                } else {
                    match outcome {
                        Err(Error::Cancelled) => self.finish_cancelled(),
                        outcome => self.finish(outcome),
                    }
                }
            }
            Ok(Poll::Pending) if undelivered => {
                drop(computation);
                self.finish_cancelled();
            }
            Ok(Poll::Pending) => {
                *self.computation.borrow_mut() = Some(computation);

                if self.must_cancel.get() {
                    let awaited = self.awaiting.borrow().clone();
                    if awaited.is_some_and(|awaited| awaited.cancel_awaited()) {
                        self.must_cancel.set(false);
                    }
                }
            }
        }
    }

    fn finish(&self, outcome: Result<T>) {
        self.future.complete(outcome);
        self.cleanup();
    }

    fn finish_cancelled(&self) {
        match self.reason.get() {
            CancelReason::Timeout => self.future.complete(Err(Error::Timeout)),
            CancelReason::Cancelled => self.future.cancel_now(),
        };
        self.cleanup();
    }

    fn cleanup(&self) {
        let awaited = self.awaiting.borrow_mut().take();
        drop(awaited);

        trace!("{} finished after {} step(s)", self.id, self.steps.get());
        if let Some(lp) = self.lp.upgrade() {
            lp.unregister_task(self.id);
        }
    }
}

impl<T: 'static> TaskCtl for TaskCore<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn schedule(self: Rc<Self>) {
        if self.scheduled.get() || self.future.done() {
            return;
        }

        let lp = match self.lp.upgrade() {
            Some(lp) => lp,
            None => return,
        };

        self.scheduled.set(true);
        let task = self.clone();
        let queued = lp.schedule_now(move || {
            task.scheduled.set(false);
            if !task.future.done() {
                task.step();
            }
        });

        if queued.is_none() {
            self.scheduled.set(false);
            self.abort();
        }
    }

    fn resume(self: Rc<Self>) {
        if self.scheduled.get() || self.future.done() {
            return;
        }
        self.step();
    }

    fn cancel_task(self: Rc<Self>) -> bool {
        if self.future.done() {
            return false;
        }

        let awaited = self.awaiting.borrow().clone();
        if awaited.is_some_and(|awaited| awaited.cancel_awaited()) {
            return true;
        }

        self.must_cancel.set(true);
        self.schedule();
        true
    }

    fn abort(&self) {
        let computation = self.computation.borrow_mut().take();
        drop(computation);

        let awaited = self.awaiting.borrow_mut().take();
        drop(awaited);

        self.future.cancel_now();
    }

    fn take_injection(&self) -> bool {
        self.inject.replace(false)
    }

    fn set_awaiting(&self, awaited: Rc<dyn Awaited>) {
        *self.awaiting.borrow_mut() = Some(awaited);
    }

    fn is_done(&self) -> bool {
        self.future.done()
    }

    fn frame(&self) -> String {
        let mut frame = self.id.to_string();
        if let Some(name) = &self.name {
            frame.push_str(&format!(" '{}'", name));
        }
        if let Some(location) = self.location {
            frame.push_str(&format!(" (spawned at {})", location));
        }
        frame
    }

    fn awaited_task(&self) -> Option<Rc<dyn TaskCtl>> {
        self.awaiting.borrow().as_ref().and_then(|awaited| awaited.awaited_task())
    }
}

impl<T: 'static> Driver for TaskCore<T> {
    fn cancel(self: Rc<Self>, reason: CancelReason) -> bool {
        if reason == CancelReason::Timeout && !self.future.done() {
            self.reason.set(CancelReason::Timeout);
        }
        self.cancel_task()
    }

    fn task(self: Rc<Self>) -> Option<Rc<dyn TaskCtl>> {
        Some(self)
    }
}

fn take_as<U: 'static>(slot: &mut dyn Any) -> Option<U> {
    slot.downcast_mut::<Option<U>>().and_then(Option::take)
}

impl EventThread {
    /// Wraps `computation` in a [`Task`] and queues its first step.
    ///
    /// # Example
    /// ```ignore
    /// let task = lp.spawn(async { Ok(6 * 7) });
    /// assert_eq!(lp.run_until_complete(task)?, 42);
    /// ```
    #[track_caller]
    pub fn spawn<T, F>(&self, computation: F) -> Task<T>
    where
        T: 'static,
        F: StdFuture<Output = Result<T>> + 'static,
    {
        Task::new(self, None, Location::caller(), Box::pin(computation))
    }

    /// Like [`EventThread::spawn`], with a name shown by [`Task::get_stack`].
    #[track_caller]
    pub fn spawn_named<T, F>(&self, name: impl Into<String>, computation: F) -> Task<T>
    where
        T: 'static,
        F: StdFuture<Output = Result<T>> + 'static,
    {
        Task::new(self, Some(name.into()), Location::caller(), Box::pin(computation))
    }

    /// Turns anything awaitable into a [`Future`] of this loop.
    ///
    /// A [`Future`] is returned as is, a [`Task`] yields its future, and any
    /// other computation is spawned as a new task.
    ///
    /// # Errors
    /// `InvalidState` if the future or task belongs to another loop.
    #[track_caller]
    pub fn ensure_future<T, F>(&self, awaitable: F) -> Result<Future<T>>
    where
        T: 'static,
        F: StdFuture<Output = Result<T>> + 'static,
    {
        let mut slot = Some(awaitable);

        let future = match take_as::<Future<T>>(&mut slot) {
            Some(future) => Some(future),
            None => take_as::<Task<T>>(&mut slot).map(Task::into_future),
        };

        if let Some(future) = future {
            if !future.belongs_to(self) {
                return Err(Error::InvalidState("future belongs to another event loop"));
            }
            return Ok(future);
        }

        match slot {
            Some(computation) => Ok(self.spawn(computation).into_future()),
            None => unreachable!("awaitable consumed without matching a future type"),
        }
    }

    /// Id of the task whose step is running, if any.
    pub fn current_task_id(&self) -> Option<TaskId> {
        context::current_task(&self.inner).map(|task| task.id())
    }
}
