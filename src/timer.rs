//! Timers that do not outlive their owner.
//!
//! A [`TimerGroup`] keeps the handles of the timers it scheduled in a slab.
//! Fired timers remove themselves; dropping the group cancels the rest. An
//! object that schedules callbacks about itself can hold a group and never
//! see a callback after it is gone.
//!
//! [`EventThread::schedule_after_weak`] covers the lighter case: the timer
//! only holds a weak reference to its target and does nothing if the target
//! was dropped by the time it fires.

use crate::runtime::{EventThread, TimerHandle};

use log::trace;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Identifies a timer of a [`TimerGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    index: usize,
    generation: u64,
}

struct Entry {
    generation: u64,
    timer: TimerHandle,
}

struct GroupInner {
    timers: RefCell<Slab<Entry>>,
    generation: Cell<u64>,
}

impl GroupInner {
    fn remove(&self, key: TimerKey) -> Option<TimerHandle> {
        let mut timers = self.timers.borrow_mut();
        let matches = timers
            .get(key.index)
            .is_some_and(|entry| entry.generation == key.generation);

        if matches {
            Some(timers.remove(key.index).timer)
        } else {
            None
        }
    }
}

/// A set of timers cancelled together when the group is dropped.
pub struct TimerGroup {
    lp: EventThread,
    inner: Rc<GroupInner>,
}

impl TimerGroup {
    pub fn new(lp: &EventThread) -> Self {
        Self {
            lp: lp.clone(),
            inner: Rc::new(GroupInner {
                timers: RefCell::new(Slab::new()),
                generation: Cell::new(0),
            }),
        }
    }

    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerKey {
        self.schedule_at(self.lp.time() + delay, callback)
    }

    pub fn schedule_at(&self, when: Instant, callback: impl FnOnce() + 'static) -> TimerKey {
        let generation = self.inner.generation.get();
        self.inner.generation.set(generation + 1);

        let index = self.inner.timers.borrow().vacant_key();
        let key = TimerKey { index, generation };

        let group = Rc::downgrade(&self.inner);
        let timer = self.lp.schedule_at(when, move || {
            if let Some(group) = group.upgrade() {
                group.remove(key);
            }
            callback();
        });

        let inserted = self.inner.timers.borrow_mut().insert(Entry { generation, timer });
        debug_assert_eq!(inserted, index);

        key
    }

    /// Cancels one timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        match self.inner.remove(key) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let entries: Vec<Entry> = self.inner.timers.borrow_mut().drain().collect();
        if !entries.is_empty() {
            trace!("cancelling {} grouped timer(s)", entries.len());
        }
        for entry in entries {
            entry.timer.cancel();
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn len(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TimerGroup {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl EventThread {
    /// Runs `callback` with `target` after `delay`, unless `target` was
    /// dropped in the meantime.
    ///
    /// The timer only holds a weak reference, so it never keeps `target`
    /// alive.
    pub fn schedule_after_weak<T: 'static>(
        &self,
        delay: Duration,
        target: &Rc<T>,
        callback: impl FnOnce(&T) + 'static,
    ) -> TimerHandle {
        let target = Rc::downgrade(target);
        self.schedule_after(delay, move || match target.upgrade() {
            Some(target) => callback(&target),
            None => trace!("weak timer target dropped before firing"),
        })
    }
}
