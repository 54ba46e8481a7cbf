//! Single-assignment result cells bound to one event loop.
//!
//! A [`Future`] starts pending and is completed at most once, with a value,
//! an error, or by cancellation. Completion never runs callbacks inline:
//! every registered callback is queued on the owning loop, in registration
//! order, so code running inside one callback can never re-enter another.
//!
//! Futures are awaitable from [`Task`](crate::Task)s. Only one task may await
//! a given future at a time.

pub mod waiters;

use crate::error::{Error, Result};
use crate::runtime::context;
use crate::runtime::core::EventThread;
use crate::runtime::handle::Handle;
use crate::runtime::WeakLoop;
use crate::task::TaskCtl;

use log::error;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future as StdFuture;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Observable state of a [`Future`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending,
    Cancelled,
    Finished,
    /// Finished, and the outcome has been read. Only reported by loops built
    /// with [`debug`](crate::EventThreadBuilder::debug) enabled.
    Retrieved,
}

/// Result of the `*_if_pending` setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    Set,
    AlreadyDone,
    /// The future is completed by a task or waiter, not by its callers.
    Rejected,
}

/// Identifies a completion callback for [`Future::remove_done_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Why a driven future is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Cancelled,
    Timeout,
}

/// Whatever completes a future on its own (a task, a composite waiter).
/// Cancelling such a future goes through its driver.
pub(crate) trait Driver {
    fn cancel(self: Rc<Self>, reason: CancelReason) -> bool;

    fn task(self: Rc<Self>) -> Option<Rc<dyn TaskCtl>> {
        None
    }
}

/// Type-erased view of the future a task is suspended on.
pub(crate) trait Awaited {
    fn cancel_awaited(&self) -> bool;

    fn awaited_task(&self) -> Option<Rc<dyn TaskCtl>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Cancelled,
    Finished,
}

enum Awaiter {
    Task(Weak<dyn TaskCtl>),
    Waker(Waker),
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>)>;

struct FutureInner<T> {
    lp: WeakLoop,
    state: Cell<State>,
    outcome: RefCell<Option<Result<T>>>,
    callbacks: RefCell<Vec<(CallbackId, DoneCallback<T>)>>,
    next_callback: Cell<u64>,
    scheduled: RefCell<Vec<Handle>>,
    awaiter: RefCell<Option<Awaiter>>,
    driver: RefCell<Option<Weak<dyn Driver>>>,
    label: RefCell<Option<String>>,
    retrieved: Cell<bool>,
    silenced: Cell<bool>,
    debug: bool,
}

/// A single-assignment asynchronous result.
///
/// `Future` is a reference: clones share the same cell. It resolves to
/// `Result<T>` when awaited; a cancelled future resolves to
/// `Err(Error::Cancelled)`.
///
/// # Example
/// ```ignore
/// let lp = EventThread::new()?;
/// let future = lp.create_future::<u32>();
///
/// let setter = future.clone();
/// lp.schedule_after(Duration::from_millis(5), move || {
///     setter.set_result(7).unwrap();
/// });
///
/// assert_eq!(lp.run_until_complete(future)?, 7);
/// ```
pub struct Future<T> {
    inner: Rc<FutureInner<T>>,
}

/// Non-owning reference to a [`Future`], for timers and registrations that
/// must not keep it alive.
pub(crate) struct WeakFuture<T> {
    inner: Weak<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for WeakFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakFuture<T> {
    pub(crate) fn upgrade(&self) -> Option<Future<T>> {
        self.inner.upgrade().map(|inner| Future { inner })
    }
}

impl<T: 'static> Future<T> {
    /// Creates a pending future bound to `lp`.
    pub fn new(lp: &EventThread) -> Self {
        Self {
            inner: Rc::new(FutureInner {
                lp: lp.downgrade(),
                state: Cell::new(State::Pending),
                outcome: RefCell::new(None),
                callbacks: RefCell::new(Vec::new()),
                next_callback: Cell::new(0),
                scheduled: RefCell::new(Vec::new()),
                awaiter: RefCell::new(None),
                driver: RefCell::new(None),
                label: RefCell::new(None),
                retrieved: Cell::new(false),
                silenced: Cell::new(false),
                debug: lp.is_debug(),
            }),
        }
    }

    pub fn state(&self) -> FutureState {
        match self.inner.state.get() {
            State::Pending => FutureState::Pending,
            State::Cancelled => FutureState::Cancelled,
            State::Finished if self.inner.debug && self.inner.retrieved.get() => FutureState::Retrieved,
            State::Finished => FutureState::Finished,
        }
    }

    /// Whether the future left the pending state.
    pub fn done(&self) -> bool {
        self.inner.state.get() != State::Pending
    }

    pub fn cancelled(&self) -> bool {
        self.inner.state.get() == State::Cancelled
    }

    /// Whether the future finished with an error other than cancellation.
    pub fn failed(&self) -> bool {
        self.inner.state.get() == State::Finished && matches!(&*self.inner.outcome.borrow(), Some(Err(_)))
    }

    /// The loop this future belongs to, while it is alive.
    pub fn event_loop(&self) -> Option<EventThread> {
        self.inner.lp.upgrade()
    }

    pub(crate) fn belongs_to(&self, lp: &EventThread) -> bool {
        self.inner.lp.is(lp)
    }

    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakFuture<T> {
        WeakFuture {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Finishes the future with `value`.
    ///
    /// # Errors
    /// `InvalidState` if the future is already done or is driven by a task.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.set_outcome(Ok(value))
    }

    /// Finishes the future with `error`. Setting `Error::Cancelled` cancels it.
    ///
    /// # Errors
    /// `InvalidState` if the future is already done or is driven by a task.
    pub fn set_error(&self, error: impl Into<Error>) -> Result<()> {
        self.set_outcome(Err(error.into()))
    }

    /// Like [`Future::set_result`], but reports instead of failing.
    pub fn set_result_if_pending(&self, value: T) -> SetStatus {
        self.set_outcome_if_pending(Ok(value))
    }

    /// Like [`Future::set_error`], but reports instead of failing.
    pub fn set_error_if_pending(&self, error: impl Into<Error>) -> SetStatus {
        self.set_outcome_if_pending(Err(error.into()))
    }

    fn set_outcome(&self, outcome: Result<T>) -> Result<()> {
        match self.set_outcome_if_pending(outcome) {
            SetStatus::Set => Ok(()),
            SetStatus::AlreadyDone => Err(Error::InvalidState("future is already done")),
            SetStatus::Rejected => Err(Error::InvalidState("future is completed by its driver")),
        }
    }

    fn set_outcome_if_pending(&self, outcome: Result<T>) -> SetStatus {
        if self.driver().is_some() {
            return SetStatus::Rejected;
        }

        let applied = match outcome {
            Err(Error::Cancelled) => self.cancel_now(),
            outcome => self.complete(outcome),
        };

        if applied { SetStatus::Set } else { SetStatus::AlreadyDone }
    }

    /// Cancels the future. Returns whether it was still pending.
    ///
    /// A future driven by a task or waiter forwards the request: the task is
    /// cancelled at its next resume, so the future may still be pending when
    /// this returns `true`.
    pub fn cancel(&self) -> bool {
        match self.driver() {
            Some(driver) => driver.cancel(CancelReason::Cancelled),
            None => self.cancel_now(),
        }
    }

    /// Applies a timeout: a plain future fails with `Error::Timeout`, a
    /// driven one is cancelled and finishes with `Error::Timeout`.
    pub(crate) fn expire(&self) {
        match self.driver() {
            Some(driver) => {
                driver.cancel(CancelReason::Timeout);
            }
            None => {
                self.complete(Err(Error::Timeout));
            }
        }
    }

    /// Returns a copy of the value, or the stored error.
    ///
    /// # Errors
    /// `Cancelled` for a cancelled future, `InvalidState` while pending, or
    /// the error the future finished with.
    pub fn result(&self) -> Result<T>
    where
        T: Clone,
    {
        self.read_outcome(|outcome| {
            outcome
                .clone()
                .unwrap_or(Err(Error::InvalidState("future result already taken")))
        })
    }

    /// Moves the value out. Later reads fail with `InvalidState`.
    pub fn take_result(&self) -> Result<T> {
        self.read_outcome(|outcome| match outcome.take() {
            Some(outcome) => outcome,
            None => Err(Error::InvalidState("future result already taken")),
        })
    }

    /// Returns the error the future finished with, or `None` on success.
    ///
    /// # Errors
    /// `Cancelled` for a cancelled future, `InvalidState` while pending.
    pub fn error(&self) -> Result<Option<Error>> {
        match self.inner.state.get() {
            State::Pending => Err(Error::InvalidState("future is not done")),
            State::Cancelled => Err(Error::Cancelled),
            State::Finished => {
                self.inner.retrieved.set(true);
                Ok(match &*self.inner.outcome.borrow() {
                    Some(Err(error)) => Some(error.clone()),
                    _ => None,
                })
            }
        }
    }

    fn read_outcome<U>(&self, read: impl FnOnce(&mut Option<Result<T>>) -> Result<U>) -> Result<U> {
        match self.inner.state.get() {
            State::Pending => Err(Error::InvalidState("future is not done")),
            State::Cancelled => Err(Error::Cancelled),
            State::Finished => {
                self.inner.retrieved.set(true);
                let mut outcome = self.inner.outcome.borrow_mut();
                if outcome.is_none() {
                    return Err(Error::InvalidState("future result already taken"));
                }
                read(&mut outcome)
            }
        }
    }

    /// Registers `callback` to run once the future is done.
    ///
    /// The callback is queued on the loop when the future completes, or
    /// right away if it already has. It never runs inline.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Future<T>) + 'static) -> CallbackId {
        let id = CallbackId(self.inner.next_callback.get());
        self.inner.next_callback.set(id.0 + 1);

        if self.done() {
            self.schedule(vec![Box::new(callback)]);
        } else {
            self.inner.callbacks.borrow_mut().push((id, Box::new(callback)));
        }

        id
    }

    /// Unregisters a callback that has not been queued yet.
    pub fn remove_done_callback(&self, id: CallbackId) -> bool {
        let removed = {
            let mut callbacks = self.inner.callbacks.borrow_mut();
            callbacks
                .iter()
                .position(|(registered, _)| *registered == id)
                .map(|index| callbacks.remove(index))
        };

        removed.is_some()
    }

    /// Suppresses the never-retrieved error report for this future.
    pub fn silence(&self) {
        self.inner.silenced.set(true);
    }

    /// Puts a done future back into the pending state.
    ///
    /// Callbacks queued by the previous completion that have not run yet
    /// are cancelled.
    ///
    /// # Errors
    /// `InvalidState` for futures driven by a task or waiter.
    pub fn clear(&self) -> Result<()> {
        if self.driver().is_some() {
            return Err(Error::InvalidState("driven futures cannot be reset"));
        }

        let scheduled = mem::take(&mut *self.inner.scheduled.borrow_mut());
        for handle in scheduled {
            handle.cancel();
        }

        self.inner.state.set(State::Pending);
        let previous = self.inner.outcome.borrow_mut().take();
        drop(previous);
        self.inner.retrieved.set(false);
        self.inner.awaiter.borrow_mut().take();

        Ok(())
    }

    pub(crate) fn set_driver(&self, driver: Weak<dyn Driver>) {
        *self.inner.driver.borrow_mut() = Some(driver);
    }

    fn driver(&self) -> Option<Rc<dyn Driver>> {
        self.inner.driver.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_label(&self, label: String) {
        *self.inner.label.borrow_mut() = Some(label);
    }

    /// Finishes the future, bypassing the driver check.
    pub(crate) fn complete(&self, outcome: Result<T>) -> bool {
        self.transition(State::Finished, Some(outcome))
    }

    /// Cancels the future, bypassing the driver.
    pub(crate) fn cancel_now(&self) -> bool {
        self.transition(State::Cancelled, None)
    }

    fn transition(&self, state: State, outcome: Option<Result<T>>) -> bool {
        if self.done() {
            return false;
        }

        self.inner.state.set(state);
        *self.inner.outcome.borrow_mut() = outcome;

        let callbacks: Vec<_> = mem::take(&mut *self.inner.callbacks.borrow_mut())
            .into_iter()
            .map(|(_, callback)| callback)
            .collect();
        self.schedule(callbacks);

        let awaiter = self.inner.awaiter.borrow_mut().take();
        match awaiter {
            Some(Awaiter::Waker(waker)) => waker.wake(),
            // Tasks are resumed by the callback they registered.
            Some(task) => *self.inner.awaiter.borrow_mut() = Some(task),
            None => {}
        }

        true
    }

    fn schedule(&self, callbacks: Vec<DoneCallback<T>>) {
        if callbacks.is_empty() {
            return;
        }

        let lp = match self.inner.lp.upgrade() {
            Some(lp) => lp,
            None => return,
        };

        let mut handles = Vec::with_capacity(callbacks.len());
        for callback in callbacks {
            let future = self.clone();
            if let Some(handle) = lp.schedule_now(move || callback(&future)) {
                handles.push(handle);
            }
        }

        let mut scheduled = self.inner.scheduled.borrow_mut();
        scheduled.retain(Handle::is_live);
        scheduled.extend(handles);
    }

    /// Suspension protocol shared by every awaitable built on futures.
    ///
    /// Returns `Ready(Ok(()))` once done, `Ready(Err)` when the awaiting task
    /// has a cancellation to deliver or another task already awaits.
    pub(crate) fn poll_done(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let task = self
            .inner
            .lp
            .upgrade()
            .and_then(|lp| context::current_task(&lp.inner));

        if let Some(task) = &task {
            if task.take_injection() {
                self.release_awaiter(task.as_ref());
                return Poll::Ready(Err(Error::Cancelled));
            }
        }

        if self.done() {
            self.inner.awaiter.borrow_mut().take();
            return Poll::Ready(Ok(()));
        }

        if let Err(error) = self.check_awaiter(task.as_deref()) {
            return Poll::Ready(Err(error));
        }

        match task {
            Some(task) => self.await_from_task(task),
            None => {
                *self.inner.awaiter.borrow_mut() = Some(Awaiter::Waker(cx.waker().clone()));
                Poll::Pending
            }
        }
    }

    fn check_awaiter(&self, task: Option<&dyn TaskCtl>) -> Result<()> {
        let awaiter = self.inner.awaiter.borrow();
        let current = match &*awaiter {
            Some(Awaiter::Task(current)) => current.upgrade(),
            _ => None,
        };

        match current {
            Some(current) if task.is_some_and(|task| task.id() == current.id()) => Ok(()),
            Some(current) if !current.is_done() => {
                Err(Error::InvalidState("future is already awaited by another task"))
            }
            _ => Ok(()),
        }
    }

    fn await_from_task(&self, task: Rc<dyn TaskCtl>) -> Poll<Result<()>> {
        let registered = matches!(
            &*self.inner.awaiter.borrow(),
            Some(Awaiter::Task(current)) if current.upgrade().is_some_and(|current| current.id() == task.id())
        );

        if !registered {
            *self.inner.awaiter.borrow_mut() = Some(Awaiter::Task(Rc::downgrade(&task)));

            let resume = Rc::downgrade(&task);
            self.add_done_callback(move |_| {
                if let Some(task) = resume.upgrade() {
                    task.resume();
                }
            });
        }

        task.set_awaiting(Rc::new(self.clone()));
        Poll::Pending
    }

    fn release_awaiter(&self, task: &dyn TaskCtl) {
        let mut awaiter = self.inner.awaiter.borrow_mut();
        let owned = matches!(
            &*awaiter,
            Some(Awaiter::Task(current)) if current.upgrade().is_some_and(|current| current.id() == task.id())
        );
        if owned {
            awaiter.take();
        }
    }
}

impl<T: Clone + 'static> StdFuture for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.poll_done(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(self.result()),
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: 'static> Awaited for Future<T> {
    fn cancel_awaited(&self) -> bool {
        self.cancel()
    }

    fn awaited_task(&self) -> Option<Rc<dyn TaskCtl>> {
        self.driver().and_then(|driver| driver.task())
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Future");
        if let Some(label) = &*self.inner.label.borrow() {
            debug.field("label", label);
        }
        debug
            .field("state", &self.inner.state.get())
            .field("callbacks", &self.inner.callbacks.borrow().len())
            .finish()
    }
}

impl<T> Drop for FutureInner<T> {
    fn drop(&mut self) {
        if self.state.get() != State::Finished || self.retrieved.get() || self.silenced.get() {
            return;
        }

        if let Some(Err(err)) = self.outcome.get_mut() {
            if !err.is_cancelled() {
                match self.label.get_mut() {
                    Some(label) => error!("{}: error was never retrieved: {}", label, err),
                    None => error!("future error was never retrieved: {}", err),
                }
            }
        }
    }
}

impl EventThread {
    /// Creates a pending future bound to this loop.
    pub fn create_future<T: 'static>(&self) -> Future<T> {
        Future::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn init() -> EventThread {
        let _ = env_logger::builder().is_test(true).try_init();
        EventThread::new().unwrap()
    }

    #[test]
    fn test_cancelled_future_never_yields_a_value() {
        let lp = init();
        let future = lp.create_future::<u32>();

        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(matches!(future.result(), Err(Error::Cancelled)));
        assert!(matches!(future.set_result(1), Err(Error::InvalidState(_))));
        assert!(matches!(future.result(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_second_set_fails_or_reports() {
        let lp = init();
        let future = lp.create_future::<u32>();

        future.set_result(1).unwrap();
        assert!(matches!(future.set_result(2), Err(Error::InvalidState(_))));
        assert_eq!(future.set_result_if_pending(3), SetStatus::AlreadyDone);
        assert_eq!(future.result().unwrap(), 1);
    }

    #[test]
    fn test_pending_future_is_not_ready() {
        let lp = init();
        let future = lp.create_future::<u32>();

        assert!(matches!(future.result(), Err(Error::InvalidState(_))));
        assert!(matches!(future.error(), Err(Error::InvalidState(_))));
        assert_eq!(future.state(), FutureState::Pending);
    }

    #[test]
    fn test_callbacks_are_queued_in_order_never_inline() {
        let lp = init();
        let future = lp.create_future::<u32>();
        let log = Rc::new(RefCell::new(Vec::new()));

        for index in 0..3 {
            let log = log.clone();
            future.add_done_callback(move |done| log.borrow_mut().push((index, done.result().unwrap())));
        }

        future.set_result(9).unwrap();
        assert!(log.borrow().is_empty());

        lp.run_once().unwrap();
        assert_eq!(*log.borrow(), vec![(0, 9), (1, 9), (2, 9)]);

        let late = log.clone();
        future.add_done_callback(move |_| late.borrow_mut().push((3, 0)));
        assert_eq!(log.borrow().len(), 3);
        lp.run_once().unwrap();
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn test_removed_callback_does_not_run() {
        let lp = init();
        let future = lp.create_future::<()>();
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        let id = future.add_done_callback(move |_| flag.set(true));
        assert!(future.remove_done_callback(id));
        assert!(!future.remove_done_callback(id));

        future.set_result(()).unwrap();
        // Keeps the tick from blocking in the poll with nothing queued.
        lp.schedule_now(|| {});
        lp.run_once().unwrap();
        assert!(!ran.get());
    }

    #[test]
    fn test_clear_cancels_queued_callbacks() {
        let lp = init();
        let future = lp.create_future::<u32>();
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        future.add_done_callback(move |_| flag.set(true));
        future.set_result(1).unwrap();
        future.clear().unwrap();

        lp.run_once().unwrap();
        assert!(!ran.get());
        assert_eq!(future.state(), FutureState::Pending);

        future.set_result(2).unwrap();
        assert_eq!(future.result().unwrap(), 2);
    }

    #[test]
    fn test_retrieved_state_only_in_debug() {
        let lp = EventThread::builder().debug(true).build().unwrap();
        let future = lp.create_future::<u32>();
        future.set_result(5).unwrap();

        assert_eq!(future.state(), FutureState::Finished);
        future.result().unwrap();
        assert_eq!(future.state(), FutureState::Retrieved);

        let plain = init();
        let future = plain.create_future::<u32>();
        future.set_result(5).unwrap();
        future.result().unwrap();
        assert_eq!(future.state(), FutureState::Finished);
    }

    #[test]
    fn test_set_cancelled_error_cancels() {
        let lp = init();
        let future = lp.create_future::<u32>();

        future.set_error(Error::Cancelled).unwrap();
        assert!(future.cancelled());
        assert!(matches!(future.error(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_take_result_moves_value_out() {
        let lp = init();
        let future = lp.create_future::<String>();
        future.set_result("owned".to_string()).unwrap();

        assert_eq!(future.take_result().unwrap(), "owned");
        assert!(matches!(future.take_result(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_reading_or_silencing_marks_error_handled() {
        let lp = init();

        let read = lp.create_future::<u32>();
        read.set_error(Error::msg("seen")).unwrap();
        assert!(!read.inner.retrieved.get());
        assert!(read.error().unwrap().is_some());
        assert!(read.inner.retrieved.get());

        let quiet = lp.create_future::<u32>();
        quiet.set_error(Error::msg("ignored")).unwrap();
        quiet.silence();
        assert!(quiet.inner.silenced.get());
        assert!(!quiet.inner.retrieved.get());
    }
}
