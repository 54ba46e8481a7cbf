//! Wakers handed to computations driven by a [`Task`](crate::Task).
//!
//! A scarlet [`Future`](crate::Future) resumes its awaiting task through a
//! completion callback. Wakers exist for everything else a computation may
//! poll (channels, third-party futures), and those can fire from any thread,
//! so a waker only carries the task id and the loop's thread-safe state.

use crate::runtime::shared::Shared;
use crate::task::TaskId;

use std::sync::Arc;
use std::task::{Wake, Waker};

pub(crate) struct TaskWaker {
    task: TaskId,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.wake_task(self.task);
    }
}

/// Creates a waker that schedules a step of `task` on the loop owning `shared`.
pub(crate) fn make_waker(task: TaskId, shared: Arc<Shared>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task, shared }))
}
