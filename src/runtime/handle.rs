//! Cancellable deferred callbacks.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

pub(crate) enum Callback {
    /// Runs at most once, then the closure is dropped.
    Once(Box<dyn FnOnce()>),

    /// Readiness callbacks: queued again every time the descriptor is ready.
    Repeat(Rc<dyn Fn()>),
}

struct HandleInner {
    cancelled: Cell<bool>,
    callback: RefCell<Option<Callback>>,
}

/// A cancellable callback owned by the ready queue or the reactor.
///
/// Cloning a `Handle` yields another reference to the same callback, so the
/// scheduler and the caller can both hold it. A cancelled handle never runs.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

impl Handle {
    pub(crate) fn new(callback: Callback) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                cancelled: Cell::new(false),
                callback: RefCell::new(Some(callback)),
            }),
        }
    }

    pub(crate) fn once(callback: impl FnOnce() + 'static) -> Self {
        Self::new(Callback::Once(Box::new(callback)))
    }

    /// Marks the handle cancelled and releases whatever the callback captured.
    pub fn cancel(&self) {
        if !self.inner.cancelled.replace(true) {
            // Dropping the closure may run arbitrary destructors, keep the
            // borrow short.
            let callback = self.inner.callback.borrow_mut().take();
            drop(callback);
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Whether the handle can still run: not cancelled and not consumed.
    pub fn is_live(&self) -> bool {
        !self.cancelled() && self.inner.callback.borrow().is_some()
    }

    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs the callback unless cancelled. Returns whether anything ran.
    pub(crate) fn run(&self) -> bool {
        if self.cancelled() {
            return false;
        }

        let mut slot = self.inner.callback.borrow_mut();
        let next = match slot.take() {
            None => return false,
            Some(Callback::Repeat(callback)) => {
                *slot = Some(Callback::Repeat(callback.clone()));
                Ok(callback)
            }
            Some(Callback::Once(callback)) => Err(callback),
        };
        drop(slot);

        match next {
            Ok(repeat) => repeat(),
            Err(once) => once(),
        }
        true
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cancelled", &self.cancelled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A [`Handle`] with a deadline.
///
/// Timer handles are totally ordered by `(when, seq)`: `seq` is the insertion
/// sequence number on the owning loop, so equal deadlines fire in scheduling
/// order.
#[derive(Clone)]
pub struct TimerHandle {
    pub(crate) handle: Handle,
    when: Instant,
    seq: u64,
    scheduled: Rc<Cell<bool>>,
    heap_cancelled: Weak<Cell<usize>>,
}

impl TimerHandle {
    pub(crate) fn new(handle: Handle, when: Instant, seq: u64, heap_cancelled: Weak<Cell<usize>>) -> Self {
        Self {
            handle,
            when,
            seq,
            scheduled: Rc::new(Cell::new(true)),
            heap_cancelled,
        }
    }

    pub fn when(&self) -> Instant {
        self.when
    }

    pub fn cancel(&self) {
        if self.handle.cancelled() {
            return;
        }

        self.handle.cancel();
        if self.scheduled.get() {
            if let Some(count) = self.heap_cancelled.upgrade() {
                count.set(count.get() + 1);
            }
        }
    }

    pub fn cancelled(&self) -> bool {
        self.handle.cancelled()
    }

    /// Whether the timer is still waiting in the heap.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    pub(crate) fn unschedule(&self) {
        self.scheduled.set(false);
    }

    fn key(&self) -> (Instant, u64) {
        (self.when, self.seq)
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TimerHandle {}

impl PartialOrd for TimerHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("when", &self.when)
            .field("seq", &self.seq)
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_handle_never_runs() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = Handle::once(move || flag.set(true));

        handle.cancel();
        assert!(!handle.run());
        assert!(!ran.get());
        assert!(!handle.is_live());
    }

    #[test]
    fn test_once_handle_runs_once() {
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let handle = Handle::once(move || counter.set(counter.get() + 1));

        assert!(handle.run());
        assert!(!handle.run());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_repeat_handle_stays_live() {
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let handle = Handle::new(Callback::Repeat(Rc::new(move || {
            counter.set(counter.get() + 1)
        })));

        assert!(handle.run());
        assert!(handle.run());
        assert!(handle.is_live());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_callback_can_cancel_its_own_handle() {
        let slot: Rc<RefCell<Option<Handle>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let handle = Handle::new(Callback::Repeat(Rc::new(move || {
            if let Some(me) = inner.borrow().as_ref() {
                me.cancel();
            }
        })));
        *slot.borrow_mut() = Some(handle.clone());

        assert!(handle.run());
        assert!(handle.cancelled());
        assert!(!handle.run());
        slot.borrow_mut().take();
    }

    #[test]
    fn test_timer_order_ties_broken_by_sequence() {
        let now = Instant::now();
        let a = TimerHandle::new(Handle::once(|| {}), now, 1, Weak::new());
        let b = TimerHandle::new(Handle::once(|| {}), now, 2, Weak::new());

        assert!(a < b);
        assert_ne!(a, b);
    }
}
