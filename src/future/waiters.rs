//! Futures that aggregate other futures.
//!
//! Every waiter tracks its members the same way: each member gets exactly
//! one completion callback, which moves it from `pending` to `done` and
//! re-evaluates the waiter's finish condition. When the waiter finishes, the
//! callbacks of the members still pending are removed before anything else
//! touches those members.
//!
//! | waiter                 | finishes when                                      |
//! |------------------------|----------------------------------------------------|
//! | [`WaitForFirst`]       | any member is done                                 |
//! | [`WaitForAll`]         | every member is done                               |
//! | [`WaitUntilException`] | every member is done, or one fails                 |
//! | [`ContinuousWait`]     | yields members one by one as they finish           |
//!
//! A waiter built `with_timeout` does not fail when the deadline passes:
//! it finishes with whatever is done at that point.
//!
//! ```ignore
//! let first = WaitForFirst::new(&lp, vec![a, b, c]);
//! let sets = lp.run_until_complete(first.future().clone())?;
//! assert_eq!(sets.done.len(), 1);
//! ```

use crate::error::Result;
use crate::future::{CallbackId, CancelReason, Driver, Future};
use crate::runtime::core::EventThread;
use crate::runtime::handle::TimerHandle;

use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// Members split by completion, as reported by a finished waiter.
pub struct WaitSets<T> {
    pub done: Vec<Future<T>>,
    pub pending: Vec<Future<T>>,
}

impl<T> Clone for WaitSets<T> {
    fn clone(&self) -> Self {
        Self {
            done: self.done.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<T> fmt::Debug for WaitSets<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSets")
            .field("done", &self.done.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Pending members and the callback each one carries.
struct Members<T> {
    pending: Vec<(Future<T>, CallbackId)>,
}

impl<T: 'static> Members<T> {
    fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Moves `member` out of the pending list. Returns `false` for members
    /// that were already detached.
    fn settle(&mut self, member: &Future<T>) -> bool {
        match self.pending.iter().position(|(pending, _)| pending.ptr_eq(member)) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every pending member's callback and hands the members back.
    fn detach(&mut self) -> Vec<Future<T>> {
        self.pending
            .drain(..)
            .map(|(member, id)| {
                member.remove_done_callback(id);
                member
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    First,
    All,
    UntilException,
}

struct WaiterCore<T> {
    policy: Policy,
    result: Future<WaitSets<T>>,
    members: RefCell<Members<T>>,
    done: RefCell<Vec<Future<T>>>,
    timer: RefCell<Option<TimerHandle>>,
}

impl<T: 'static> WaiterCore<T> {
    fn start(lp: &EventThread, policy: Policy, futures: Vec<Future<T>>, timeout: Option<Duration>) -> Rc<Self> {
        let core = Rc::new(Self {
            policy,
            result: lp.create_future(),
            members: RefCell::new(Members::new()),
            done: RefCell::new(Vec::new()),
            timer: RefCell::new(None),
        });

        let driver: Weak<WaiterCore<T>> = Rc::downgrade(&core);
        core.result.set_driver(driver);

        for member in futures {
            if member.done() {
                core.done.borrow_mut().push(member);
                continue;
            }

            let waiter = core.clone();
            let id = member.add_done_callback(move |member| waiter.on_member_done(member));
            core.members.borrow_mut().pending.push((member, id));
        }

        if core.should_finish() {
            core.finish();
            return core;
        }

        if let Some(delay) = timeout {
            let waiter = Rc::downgrade(&core);
            let timer = lp.schedule_after(delay, move || {
                if let Some(waiter) = waiter.upgrade() {
                    trace!("{:?} waiter timed out", waiter.policy);
                    waiter.finish();
                }
            });
            *core.timer.borrow_mut() = Some(timer);
        }

        core
    }

    fn on_member_done(&self, member: &Future<T>) {
        if self.result.done() || !self.members.borrow_mut().settle(member) {
            return;
        }

        self.done.borrow_mut().push(member.clone());
        if self.should_finish() {
            self.finish();
        }
    }

    fn should_finish(&self) -> bool {
        let pending = self.members.borrow().len();
        let done = self.done.borrow();

        match self.policy {
            Policy::All => pending == 0,
            Policy::First => pending == 0 || !done.is_empty(),
            Policy::UntilException => pending == 0 || done.iter().any(Future::failed),
        }
    }

    /// Finishes with the current split. Pending members keep running.
    fn finish(&self) {
        if self.result.done() {
            return;
        }

        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }

        let pending = self.members.borrow_mut().detach();
        let done = self.done.borrow().clone();
        self.result.complete(Ok(WaitSets { done, pending }));
    }
}

impl<T: 'static> Driver for WaiterCore<T> {
    fn cancel(self: Rc<Self>, reason: CancelReason) -> bool {
        if self.result.done() {
            return false;
        }

        if reason == CancelReason::Timeout {
            self.finish();
            return true;
        }

        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }

        let pending = self.members.borrow_mut().detach();
        for member in &pending {
            member.cancel();
        }

        self.result.cancel_now()
    }
}

macro_rules! waiter {
    ($(#[$doc:meta])* $name:ident, $policy:expr) => {
        $(#[$doc])*
        pub struct $name<T> {
            core: Rc<WaiterCore<T>>,
        }

        impl<T: 'static> $name<T> {
            pub fn new(lp: &EventThread, futures: Vec<Future<T>>) -> Self {
                Self {
                    core: WaiterCore::start(lp, $policy, futures, None),
                }
            }

            /// Like `new`, but finishes with the current split once `delay`
            /// elapses instead of waiting any longer.
            pub fn with_timeout(lp: &EventThread, futures: Vec<Future<T>>, delay: Duration) -> Self {
                Self {
                    core: WaiterCore::start(lp, $policy, futures, Some(delay)),
                }
            }

            /// The future the waiter completes.
            pub fn future(&self) -> &Future<WaitSets<T>> {
                &self.core.result
            }

            /// Number of members that have not finished yet.
            pub fn pending_count(&self) -> usize {
                self.core.members.borrow().len()
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                }
            }
        }

        impl<T> Deref for $name<T> {
            type Target = Future<WaitSets<T>>;

            fn deref(&self) -> &Future<WaitSets<T>> {
                &self.core.result
            }
        }

        impl<T: 'static> StdFuture for $name<T> {
            type Output = Result<WaitSets<T>>;

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut future = self.core.result.clone();
                Pin::new(&mut future).poll(cx)
            }
        }

        impl<T: 'static> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("done", &self.core.done.borrow().len())
                    .field("pending", &self.core.members.borrow().len())
                    .field("result", &self.core.result)
                    .finish()
            }
        }
    };
}

waiter!(
    /// Finishes as soon as any member is done.
    ///
    /// Cancelling the waiter cancels every member still pending.
    WaitForFirst,
    Policy::First
);

waiter!(
    /// Finishes once every member is done, whatever the outcome.
    WaitForAll,
    Policy::All
);

waiter!(
    /// Finishes once every member is done, or as soon as one finishes with
    /// an error other than cancellation.
    ///
    /// The remaining members keep running; cancel the waiter to stop them.
    WaitUntilException,
    Policy::UntilException
);

type Round<T> = Future<Option<Future<T>>>;

struct ContinuousCore<T> {
    lp: EventThread,
    timeout: Option<Duration>,
    members: RefCell<Members<T>>,
    ready: RefCell<VecDeque<Future<T>>>,
    round: RefCell<Round<T>>,
    handed: Cell<bool>,
    timer: RefCell<Option<TimerHandle>>,
}

impl<T: 'static> ContinuousCore<T> {
    fn on_member_done(&self, member: &Future<T>) {
        if !self.members.borrow_mut().settle(member) {
            return;
        }

        let round = self.round.borrow().clone();
        if round.done() {
            self.ready.borrow_mut().push_back(member.clone());
        } else {
            self.end_round(Some(member.clone()));
        }
    }

    fn end_round(&self, member: Option<Future<T>>) {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }

        let round = self.round.borrow().clone();
        round.complete(Ok(member));
    }

    fn new_round(self: &Rc<Self>) {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }

        let round: Round<T> = self.lp.create_future();
        let driver: Weak<ContinuousCore<T>> = Rc::downgrade(self);
        round.set_driver(driver);
        *self.round.borrow_mut() = round;
        self.handed.set(false);

        let next = self.ready.borrow_mut().pop_front();
        if let Some(member) = next {
            self.end_round(Some(member));
            return;
        }

        if self.members.borrow().len() == 0 {
            self.end_round(None);
            return;
        }

        if let Some(delay) = self.timeout {
            let waiter = Rc::downgrade(self);
            let timer = self.lp.schedule_after(delay, move || {
                if let Some(waiter) = waiter.upgrade() {
                    trace!("continuous wait round timed out");
                    waiter.end_round(None);
                }
            });
            *self.timer.borrow_mut() = Some(timer);
        }
    }
}

impl<T: 'static> Driver for ContinuousCore<T> {
    fn cancel(self: Rc<Self>, reason: CancelReason) -> bool {
        let round = self.round.borrow().clone();
        if round.done() {
            return false;
        }

        if reason == CancelReason::Timeout {
            self.end_round(None);
            return true;
        }

        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }

        let pending = self.members.borrow_mut().detach();
        for member in &pending {
            member.cancel();
        }

        round.cancel_now()
    }
}

/// Yields members one at a time, in completion order, and accepts new
/// members while in use.
///
/// Each round is a future resolving to the next finished member, or to
/// `None` when no member is left or the round's timeout elapsed. Members
/// that finish between rounds are buffered for the following ones.
///
/// ```ignore
/// let waiter = ContinuousWait::new(&lp, requests);
/// while let Some(done) = waiter.next().await? {
///     handle(done.result()?);
///     if let Some(more) = follow_up() {
///         waiter.add(more);
///     }
/// }
/// ```
pub struct ContinuousWait<T: 'static> {
    core: Rc<ContinuousCore<T>>,
}

impl<T: 'static> ContinuousWait<T> {
    pub fn new(lp: &EventThread, futures: Vec<Future<T>>) -> Self {
        Self::start(lp, futures, None)
    }

    /// Every round resolves to `None` if no member finishes within `delay`.
    pub fn with_timeout(lp: &EventThread, futures: Vec<Future<T>>, delay: Duration) -> Self {
        Self::start(lp, futures, Some(delay))
    }

    fn start(lp: &EventThread, futures: Vec<Future<T>>, timeout: Option<Duration>) -> Self {
        let round: Round<T> = lp.create_future();
        round.cancel_now();

        let waiter = Self {
            core: Rc::new(ContinuousCore {
                lp: lp.clone(),
                timeout,
                members: RefCell::new(Members::new()),
                ready: RefCell::new(VecDeque::new()),
                round: RefCell::new(round),
                handed: Cell::new(false),
                timer: RefCell::new(None),
            }),
        };

        for member in futures {
            waiter.add(member);
        }
        waiter.core.new_round();

        waiter
    }

    /// Adds a member. One that is already done is buffered right away.
    pub fn add(&self, member: Future<T>) {
        if member.done() {
            let round = self.core.round.borrow().clone();
            if round.done() {
                self.core.ready.borrow_mut().push_back(member);
            } else {
                self.core.end_round(Some(member));
            }
            return;
        }

        let waiter = Rc::downgrade(&self.core);
        let id = member.add_done_callback(move |member| {
            if let Some(waiter) = waiter.upgrade() {
                waiter.on_member_done(member);
            }
        });
        self.core.members.borrow_mut().pending.push((member, id));
    }

    /// The current round.
    pub fn round(&self) -> Round<T> {
        self.core.round.borrow().clone()
    }

    /// Starts a new round if the current one is done.
    ///
    /// The new round resolves right away with the next buffered member, or
    /// with `None` when there is nothing left to wait for; otherwise it
    /// stays pending.
    pub fn reset(&self) {
        if self.core.round.borrow().done() {
            self.core.new_round();
        }
    }

    /// Returns the round to await: the current one the first time, a fresh
    /// one once the current round was handed out and is done.
    pub fn next(&self) -> Round<T> {
        if self.core.handed.get() {
            self.reset();
        }
        self.core.handed.set(true);
        self.round()
    }

    /// Members that have not finished yet.
    pub fn pending_count(&self) -> usize {
        self.core.members.borrow().len()
    }

    /// Members that finished and were not yielded yet.
    pub fn ready_count(&self) -> usize {
        self.core.ready.borrow().len()
    }

    /// Cancels the current round and every pending member.
    pub fn cancel(&self) -> bool {
        self.core.clone().cancel(CancelReason::Cancelled)
    }
}

impl<T: 'static> Drop for ContinuousWait<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.core) > 1 {
            return;
        }

        if let Some(timer) = self.core.timer.borrow_mut().take() {
            timer.cancel();
        }
        let detached = self.core.members.borrow_mut().detach();
        drop(detached);
    }
}

impl<T: 'static> fmt::Debug for ContinuousWait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousWait")
            .field("pending", &self.core.members.borrow().len())
            .field("ready", &self.core.ready.borrow().len())
            .field("round", &*self.core.round.borrow())
            .finish()
    }
}

/// Awaits every future and collects the values in order, failing with the
/// first error in member order.
pub async fn gather<T: Clone + 'static>(lp: &EventThread, futures: Vec<Future<T>>) -> Result<Vec<T>> {
    let sets = WaitForAll::new(lp, futures.clone()).await?;
    debug_assert!(sets.pending.is_empty());

    futures.iter().map(Future::result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn init() -> EventThread {
        let _ = env_logger::builder().is_test(true).try_init();
        EventThread::new().unwrap()
    }

    fn futures(lp: &EventThread, n: usize) -> Vec<Future<u32>> {
        (0..n).map(|_| lp.create_future()).collect()
    }

    #[test]
    fn test_empty_waiter_is_finished() {
        let lp = init();
        let waiter = WaitForAll::<u32>::new(&lp, Vec::new());

        let sets = waiter.result().unwrap();
        assert!(sets.done.is_empty());
        assert!(sets.pending.is_empty());
    }

    #[test]
    fn test_first_finishes_on_one_member() {
        let lp = init();
        let members = futures(&lp, 3);
        let waiter = WaitForFirst::new(&lp, members.clone());

        members[1].set_result(1).unwrap();
        lp.run_once().unwrap();

        let sets = waiter.result().unwrap();
        assert_eq!(sets.done.len(), 1);
        assert!(sets.done[0].ptr_eq(&members[1]));
        assert_eq!(sets.pending.len(), 2);
        assert!(!members[0].done(), "pending members keep running");
    }

    #[test]
    fn test_cancelling_first_cancels_pending_members() {
        let lp = init();
        let members = futures(&lp, 2);
        let waiter = WaitForFirst::new(&lp, members.clone());

        assert!(waiter.cancel());
        assert!(waiter.cancelled());
        assert!(members.iter().all(Future::cancelled));
    }

    #[test]
    fn test_waiter_rejects_external_results() {
        let lp = init();
        let waiter = WaitForAll::new(&lp, futures(&lp, 1));

        let forged = WaitSets {
            done: Vec::new(),
            pending: Vec::new(),
        };
        assert!(matches!(waiter.set_result(forged), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_timeout_reports_partial_sets() {
        let lp = init();
        let members = futures(&lp, 2);
        let waiter = WaitForAll::with_timeout(&lp, members.clone(), Duration::from_millis(1));

        members[0].set_result(0).unwrap();
        let sets = lp.run_until_complete(waiter.future().clone()).unwrap();

        assert_eq!(sets.done.len(), 1);
        assert_eq!(sets.pending.len(), 1);
        assert!(!members[1].done());
    }

    #[test]
    fn test_continuous_yields_in_completion_order() {
        let lp = init();
        let members = futures(&lp, 3);
        let waiter = ContinuousWait::new(&lp, members.clone());

        members[2].set_result(2).unwrap();
        members[0].set_result(0).unwrap();
        lp.run_once().unwrap();

        let first = waiter.next().result().unwrap().unwrap();
        assert!(first.ptr_eq(&members[2]));

        let second = waiter.next().result().unwrap().unwrap();
        assert!(second.ptr_eq(&members[0]));

        let third = waiter.next();
        assert!(!third.done());

        let extra = lp.create_future();
        waiter.add(extra.clone());
        extra.set_result(7).unwrap();
        lp.run_once().unwrap();
        assert!(third.result().unwrap().unwrap().ptr_eq(&extra));

        members[1].set_result(1).unwrap();
        lp.run_once().unwrap();
        assert!(waiter.next().result().unwrap().unwrap().ptr_eq(&members[1]));
        assert!(waiter.next().result().unwrap().is_none());
    }

    #[test]
    fn test_continuous_round_timeout_yields_none() {
        let lp = init();
        let waiter = ContinuousWait::with_timeout(&lp, futures(&lp, 1), Duration::from_millis(1));

        let round = lp.run_until_complete(waiter.next()).unwrap();
        assert!(round.is_none());
        assert_eq!(waiter.pending_count(), 1);
    }
}
