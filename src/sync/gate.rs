use crate::error::{Error, Result};
use crate::future::Future;
use crate::future::waiters::WaitForAll;
use crate::runtime::{EventThread, WeakLoop};
use crate::sync::lock::CountingLock;

use log::debug;
use std::cell::RefCell;
use std::fmt;
use std::future::Future as StdFuture;
use std::rc::Rc;

struct GateCore<T> {
    lp: WeakLoop,
    permits: CountingLock,
    active: RefCell<Vec<Future<T>>>,
    failure: RefCell<Option<Error>>,
}

impl<T: 'static> GateCore<T> {
    fn check(&self) -> Result<()> {
        match &*self.failure.borrow() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn on_member_done(&self, member: &Future<T>) {
        self.active.borrow_mut().retain(|active| !active.ptr_eq(member));

        if !member.failed() || self.failure.borrow().is_some() {
            return;
        }

        if let Ok(Some(err)) = member.error() {
            debug!("gate member failed, cancelling the others: {}", err);
            *self.failure.borrow_mut() = Some(err);
        }

        let others = self.active.borrow().clone();
        for other in others {
            other.cancel();
        }
    }
}

/// Runs at most `capacity` members at once.
///
/// [`BoundedGate::add`] admits a member once fewer than `capacity` members
/// are running, waiting otherwise. The first member to fail with an error
/// other than cancellation cancels every other member, and that error is
/// returned by every later `add` and by [`BoundedGate::finish`].
///
/// ```ignore
/// let gate = BoundedGate::new(&lp, 2);
/// for url in urls {
///     gate.add(fetch(url)).await?;
/// }
/// gate.finish().await?;
/// ```
pub struct BoundedGate<T> {
    core: Rc<GateCore<T>>,
}

impl<T> Clone for BoundedGate<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> BoundedGate<T> {
    /// A capacity of zero is treated as one.
    pub fn new(lp: &EventThread, capacity: usize) -> Self {
        Self {
            core: Rc::new(GateCore {
                lp: lp.downgrade(),
                permits: CountingLock::new(lp, capacity),
                active: RefCell::new(Vec::new()),
                failure: RefCell::new(None),
            }),
        }
    }

    /// Waits for room, then starts tracking `awaitable`.
    ///
    /// A plain computation is only spawned once admitted.
    ///
    /// # Returns
    /// The member's future, which the gate keeps running.
    ///
    /// # Errors
    /// The failure of an earlier member, or `Cancelled` if the waiting task
    /// is cancelled.
    pub fn add<F>(&self, awaitable: F) -> impl StdFuture<Output = Result<Future<T>>> + 'static
    where
        F: StdFuture<Output = Result<T>> + 'static,
    {
        let core = self.core.clone();

        async move {
            core.check()?;
            let permit = core.permits.acquire().await?;
            core.check()?;

            let member = match core.lp.upgrade() {
                Some(lp) => lp.ensure_future(awaitable)?,
                None => return Err(Error::InvalidState("event loop is gone")),
            };
            core.active.borrow_mut().push(member.clone());

            let gate = Rc::downgrade(&core);
            member.add_done_callback(move |done| {
                drop(permit);
                if let Some(gate) = gate.upgrade() {
                    gate.on_member_done(done);
                }
            });

            Ok(member)
        }
    }

    /// Waits until every admitted member is done.
    ///
    /// # Errors
    /// The first member failure, if any.
    pub fn finish(&self) -> impl StdFuture<Output = Result<()>> + 'static {
        let core = self.core.clone();

        async move {
            loop {
                let active = core.active.borrow().clone();
                if active.is_empty() {
                    break;
                }

                let all = match core.lp.upgrade() {
                    Some(lp) => WaitForAll::new(&lp, active),
                    None => return Err(Error::InvalidState("event loop is gone")),
                };
                all.await?;
            }

            core.check()
        }
    }

    /// Cancels every running member.
    pub fn cancel_all(&self) {
        let active = self.core.active.borrow().clone();
        for member in active {
            member.cancel();
        }
    }

    /// Number of admitted members still running.
    pub fn active_count(&self) -> usize {
        self.core.active.borrow().len()
    }

    pub fn capacity(&self) -> usize {
        self.core.permits.capacity()
    }

    /// The error that stopped the gate, if any.
    pub fn failure(&self) -> Option<Error> {
        self.core.failure.borrow().clone()
    }
}

impl<T> fmt::Debug for BoundedGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedGate")
            .field("permits", &self.core.permits)
            .field("active", &self.core.active.borrow().len())
            .field("failed", &self.core.failure.borrow().is_some())
            .finish()
    }
}
