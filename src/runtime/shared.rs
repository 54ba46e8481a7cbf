//! Loop state reachable from other threads.
//!
//! Everything else the loop owns lives behind `Rc` on the loop thread. This
//! is the one piece shared through an `Arc`: thread-safe producers append to
//! lock-free queues here and poke the self-pipe so a blocked poll returns.

use crate::reactor::notify::Notifier;
use crate::runtime::core::EventThread;
use crate::runtime::pause::PauseState;
use crate::task::TaskId;

use crossbeam_queue::SegQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

/// A callback submitted from another thread, run on the loop.
pub(crate) type Remote = Box<dyn FnOnce(&EventThread) + Send>;

pub(crate) struct Shared {
    inbox: SegQueue<Remote>,
    woken: SegQueue<TaskId>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) pause: PauseState,
    owner: ThreadId,
    stop_requested: AtomicBool,
    running: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            inbox: SegQueue::new(),
            woken: SegQueue::new(),
            notifier,
            pause: PauseState::new(),
            owner: thread::current().id(),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Queues `remote` for the next tick. Returns `false` once the loop is
    /// closed, in which case `remote` is dropped.
    pub(crate) fn submit(&self, remote: Remote) -> bool {
        if self.is_closed() {
            return false;
        }

        self.inbox.push(remote);
        self.wake_loop();
        true
    }

    /// Marks a task runnable. Used by wakers, which may fire on any thread.
    pub(crate) fn wake_task(&self, id: TaskId) {
        if self.is_closed() {
            return;
        }

        self.woken.push(id);
        self.wake_loop();
    }

    pub(crate) fn pop_remote(&self) -> Option<Remote> {
        self.inbox.pop()
    }

    pub(crate) fn pop_woken(&self) -> Option<TaskId> {
        self.woken.pop()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.inbox.is_empty() || !self.woken.is_empty()
    }

    /// A loop blocked in its poll only needs the pipe when the wake comes
    /// from elsewhere: on the loop thread the next tick sees the queues.
    pub(crate) fn wake_loop(&self) {
        if !self.on_loop_thread() {
            self.notifier.notify();
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake_loop();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drops everything still queued. Called once the loop is closed.
    pub(crate) fn discard_pending(&self) -> usize {
        let mut dropped = 0;
        while self.inbox.pop().is_some() {
            dropped += 1;
        }
        while self.woken.pop().is_some() {}
        dropped
    }
}
