//! Per-loop record of the task whose step is running.
//!
//! A [`Future`](crate::Future) polled during a task step needs to know which
//! task is awaiting it, so it can resume that task directly on completion and
//! deliver pending cancellations. The loop keeps that task in a slot set for
//! the duration of the step. No thread-local state is involved: the slot
//! belongs to the loop, and futures reach it through their own loop handle.

use crate::runtime::core::Inner;
use crate::task::TaskCtl;

use std::rc::Rc;

/// Restores the previously running task when dropped.
pub(crate) struct TaskScope<'a> {
    inner: &'a Inner,
    previous: Option<Rc<dyn TaskCtl>>,
}

/// Marks `task` as running on `inner` until the returned scope is dropped.
pub(crate) fn enter_task(inner: &Inner, task: Rc<dyn TaskCtl>) -> TaskScope<'_> {
    let previous = inner.current_task.borrow_mut().replace(task);

    TaskScope { inner, previous }
}

/// Returns the task whose step is running on `inner`, if any.
pub(crate) fn current_task(inner: &Inner) -> Option<Rc<dyn TaskCtl>> {
    inner.current_task.borrow().clone()
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        *self.inner.current_task.borrow_mut() = self.previous.take();
    }
}
