use crate::error::{Error, Result};
use crate::future::Future;
use crate::runtime::{EventThread, WeakLoop};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future as StdFuture;
use std::mem;
use std::rc::Rc;

struct EventCore {
    lp: WeakLoop,
    flag: Cell<bool>,
    waiters: RefCell<Vec<Future<()>>>,
}

/// A flag tasks can wait on.
///
/// [`Event::set`] releases every current waiter and lets later waits pass
/// immediately until [`Event::clear`].
#[derive(Clone)]
pub struct Event {
    core: Rc<EventCore>,
}

impl Event {
    pub fn new(lp: &EventThread) -> Self {
        Self {
            core: Rc::new(EventCore {
                lp: lp.downgrade(),
                flag: Cell::new(false),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.core.flag.get()
    }

    pub fn set(&self) {
        if self.core.flag.replace(true) {
            return;
        }

        let waiters = mem::take(&mut *self.core.waiters.borrow_mut());
        for waiter in waiters {
            waiter.set_result_if_pending(());
        }
    }

    pub fn clear(&self) {
        self.core.flag.set(false);
    }

    /// Resolves once the flag is set; immediately if it already is.
    pub fn wait(&self) -> impl StdFuture<Output = Result<()>> + 'static {
        let core = self.core.clone();

        async move {
            if core.flag.get() {
                return Ok(());
            }

            let waiter = match core.lp.upgrade() {
                Some(lp) => lp.create_future::<()>(),
                None => return Err(Error::InvalidState("event loop is gone")),
            };
            core.waiters.borrow_mut().push(waiter.clone());

            let outcome = waiter.clone().await;
            if outcome.is_err() {
                core.waiters.borrow_mut().retain(|pending| !pending.ptr_eq(&waiter));
            }
            outcome
        }
    }

    /// Number of tasks waiting for the flag.
    pub fn waiting(&self) -> usize {
        self.core.waiters.borrow().iter().filter(|waiter| !waiter.done()).count()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.core.flag.get())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_releases_waiters_and_later_waits_pass() {
        let lp = EventThread::new().unwrap();
        let event = Event::new(&lp);

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let event = event.clone();
                lp.spawn(async move { event.wait().await })
            })
            .collect();

        lp.run_once().unwrap();
        assert_eq!(event.waiting(), 3);

        event.set();
        for task in tasks {
            lp.run_until_complete(task).unwrap();
        }

        let late = lp.spawn(event.wait());
        lp.run_once().unwrap();
        assert!(late.done());
    }

    #[test]
    fn test_clear_makes_waits_block_again() {
        let lp = EventThread::new().unwrap();
        let event = Event::new(&lp);
        event.set();
        event.clear();

        let task = lp.spawn(event.wait());
        lp.run_once().unwrap();
        assert!(!task.done());
        assert!(!event.is_set());

        task.cancel();
        assert!(matches!(lp.run_until_complete(task), Err(Error::Cancelled)));
        assert_eq!(event.waiting(), 0);
    }
}
