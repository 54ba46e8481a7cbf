//! Pausing the loop thread from another thread.
//!
//! A paused loop finishes its current tick, then blocks at the top of the
//! next one until every [`PauseGuard`] is dropped. Nothing runs on the loop
//! in between, so the pausing thread may inspect shared state freely.

use crate::error::{Error, Result};
use crate::runtime::shared::Shared;

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    requested: usize,
    paused: bool,
}

pub(crate) struct PauseState {
    state: Mutex<State>,
    changed: Condvar,
}

impl PauseState {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        }
    }

    /// Called by the loop between ticks. Blocks while a pause is requested.
    pub(crate) fn checkpoint(&self) {
        let mut state = self.state.lock();
        if state.requested == 0 {
            return;
        }

        debug!("event loop paused");
        state.paused = true;
        self.changed.notify_all();

        while state.requested > 0 {
            self.changed.wait(&mut state);
        }

        state.paused = false;
        debug!("event loop resumed");
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn request(&self) {
        self.state.lock().requested += 1;
    }

    fn withdraw(&self) {
        let mut state = self.state.lock();
        state.requested = state.requested.saturating_sub(1);
        self.changed.notify_all();
    }

    fn wait_paused(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();

        while !state.paused {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.paused;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }

        true
    }
}

/// Keeps the loop paused while alive.
#[must_use = "the loop resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    shared: Arc<Shared>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.shared.pause.withdraw();
    }
}

/// Blocks the calling thread until the loop reaches its next safe point.
///
/// Fails with `InvalidState` on the loop thread itself or when the loop is
/// not running, and with `Timeout` when the loop did not pause in time.
pub(crate) fn pause(shared: &Arc<Shared>, timeout: Option<Duration>) -> Result<PauseGuard> {
    if shared.on_loop_thread() {
        return Err(Error::InvalidState("cannot pause the event loop from its own thread"));
    }

    if !shared.is_running() {
        return Err(Error::InvalidState("event loop is not running"));
    }

    shared.pause.request();
    let guard = PauseGuard {
        shared: shared.clone(),
    };
    shared.notifier.notify();

    if guard.shared.pause.wait_paused(timeout) {
        Ok(guard)
    } else {
        Err(Error::Timeout)
    }
}
