use crate::error::{Error, Result};
use crate::future::{Future, SetStatus};
use crate::runtime::{EventThread, WeakLoop};

use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::rc::Rc;

struct LockCore {
    lp: WeakLoop,
    capacity: usize,
    holders: Cell<usize>,
    waiters: RefCell<VecDeque<Future<()>>>,
}

impl LockCore {
    fn try_take(&self) -> bool {
        if self.holders.get() < self.capacity && self.waiters.borrow().is_empty() {
            self.holders.set(self.holders.get() + 1);
            true
        } else {
            false
        }
    }

    /// Hands the slot to the longest waiting acquirer, or frees it.
    fn release(&self) {
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            match next {
                Some(ticket) => {
                    if ticket.set_result_if_pending(()) == SetStatus::Set {
                        return;
                    }
                }
                None => {
                    self.holders.set(self.holders.get().saturating_sub(1));
                    return;
                }
            }
        }
    }

    fn forget(&self, ticket: &Future<()>) {
        self.waiters.borrow_mut().retain(|waiting| !waiting.ptr_eq(ticket));
    }
}

/// Proof of holding one slot of a [`CountingLock`] or [`Lock`]. Dropping it
/// releases the slot.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    core: Rc<LockCore>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.core.release();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("holders", &self.core.holders.get()).finish()
    }
}

/// A FIFO semaphore: at most `capacity` guards exist at a time, and
/// acquirers are admitted strictly in arrival order.
#[derive(Clone)]
pub struct CountingLock {
    core: Rc<LockCore>,
}

impl CountingLock {
    /// A capacity of zero is treated as one.
    pub fn new(lp: &EventThread, capacity: usize) -> Self {
        Self {
            core: Rc::new(LockCore {
                lp: lp.downgrade(),
                capacity: capacity.max(1),
                holders: Cell::new(0),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Takes a slot without waiting. Fails if one would have to wait,
    /// including behind earlier acquirers.
    pub fn try_acquire(&self) -> Option<LockGuard> {
        self.core.try_take().then(|| LockGuard {
            core: self.core.clone(),
        })
    }

    /// Waits for a slot.
    ///
    /// # Errors
    /// `Cancelled` if the waiting task is cancelled; its place in the queue
    /// is given up, and a slot handed to it in the meantime passes on to the
    /// next acquirer.
    pub fn acquire(&self) -> impl StdFuture<Output = Result<LockGuard>> + 'static {
        let core = self.core.clone();

        async move {
            if core.try_take() {
                return Ok(LockGuard { core });
            }

            let ticket = match core.lp.upgrade() {
                Some(lp) => lp.create_future::<()>(),
                None => return Err(Error::InvalidState("event loop is gone")),
            };
            core.waiters.borrow_mut().push_back(ticket.clone());

            match ticket.clone().await {
                Ok(()) => Ok(LockGuard { core }),
                Err(err) => {
                    if ticket.done() && !ticket.cancelled() {
                        trace!("acquirer cancelled after being admitted, passing the slot on");
                        core.release();
                    } else {
                        ticket.cancel();
                        core.forget(&ticket);
                    }
                    Err(err)
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Number of guards currently held.
    pub fn holders(&self) -> usize {
        self.core.holders.get()
    }

    /// Number of acquirers waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.core.waiters.borrow().iter().filter(|ticket| !ticket.done()).count()
    }

    pub fn is_full(&self) -> bool {
        self.core.holders.get() >= self.core.capacity
    }
}

impl fmt::Debug for CountingLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingLock")
            .field("capacity", &self.core.capacity)
            .field("holders", &self.core.holders.get())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A FIFO mutex.
///
/// ```ignore
/// let lock = Lock::new(&lp);
/// let guard = lock.acquire().await?;
/// // exclusive section, released on every exit path
/// drop(guard);
/// ```
#[derive(Clone, Debug)]
pub struct Lock {
    inner: CountingLock,
}

impl Lock {
    pub fn new(lp: &EventThread) -> Self {
        Self {
            inner: CountingLock::new(lp, 1),
        }
    }

    pub fn try_acquire(&self) -> Option<LockGuard> {
        self.inner.try_acquire()
    }

    pub fn acquire(&self) -> impl StdFuture<Output = Result<LockGuard>> + 'static {
        self.inner.acquire()
    }

    pub fn locked(&self) -> bool {
        self.inner.is_full()
    }

    pub fn waiting(&self) -> usize {
        self.inner.waiting()
    }
}
