//! Periodic callbacks.
//!
//! A [`Cycler`] is a task that wakes up every `period` and runs its
//! registered functions one after another, in ascending priority order
//! (ties run in registration order). Functions are either synchronous or
//! return a computation the cycler awaits before moving to the next one.
//!
//! Registration works from any thread through a [`CyclerHandle`]: requests
//! are queued and applied on the loop right before the next cycle, which is
//! the only point where registrations are observable.
//!
//! ```ignore
//! let cycler = Cycler::new(&lp, Duration::from_secs(30));
//! cycler.add(10, CycleFn::from_sync(|_| {
//!     flush_metrics();
//!     Ok(())
//! }));
//!
//! let handle = cycler.handle();
//! std::thread::spawn(move || handle.remove(id));
//! ```

use crate::error::{Error, Result};
use crate::runtime::{EventThread, WeakLoop};
use crate::task::Task;
use crate::time::sleep;

use crossbeam_queue::SegQueue;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use log::{debug, trace};
use scarlet_executor::panic_message;
use std::cell::RefCell;
use std::fmt;
use std::future::Future as StdFuture;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

type SyncFn = Box<dyn Fn(&Cycler) -> Result<()> + Send>;
type AsyncFn = Box<dyn Fn(&Cycler) -> LocalBoxFuture<'static, Result<()>> + Send>;

/// A function run on every cycle.
pub enum CycleFn {
    Sync(SyncFn),
    Async(AsyncFn),
}

impl CycleFn {
    pub fn from_sync<F>(function: F) -> Self
    where
        F: Fn(&Cycler) -> Result<()> + Send + 'static,
    {
        CycleFn::Sync(Box::new(function))
    }

    pub fn from_async<F, Fut>(function: F) -> Self
    where
        F: Fn(&Cycler) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<()>> + 'static,
    {
        CycleFn::Async(Box::new(move |cycler| function(cycler).boxed_local()))
    }
}

impl fmt::Debug for CycleFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFn::Sync(_) => f.write_str("CycleFn::Sync"),
            CycleFn::Async(_) => f.write_str("CycleFn::Async"),
        }
    }
}

/// Identifies a registered [`CycleFn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleId(u64);

enum Command {
    Add(CycleId, i32, CycleFn),
    Remove(CycleId),
}

/// The part of a cycler other threads can reach.
struct Remote {
    commands: SegQueue<Command>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl Remote {
    fn next_id(&self) -> CycleId {
        CycleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry {
    id: CycleId,
    priority: i32,
    function: Rc<CycleFn>,
}

struct CyclerCore {
    lp: WeakLoop,
    period: Duration,
    entries: RefCell<Vec<Entry>>,
    remote: Arc<Remote>,
    task: RefCell<Option<Task<()>>>,
}

/// Runs registered functions every `period`.
///
/// Clones refer to the same cycler. It keeps cycling until
/// [`Cycler::stop`] or until the loop is closed.
#[derive(Clone)]
pub struct Cycler {
    core: Rc<CyclerCore>,
}

impl Cycler {
    /// Creates the cycler and starts its task. The first cycle runs one
    /// `period` from now.
    pub fn new(lp: &EventThread, period: Duration) -> Self {
        let cycler = Self {
            core: Rc::new(CyclerCore {
                lp: lp.downgrade(),
                period,
                entries: RefCell::new(Vec::new()),
                remote: Arc::new(Remote {
                    commands: SegQueue::new(),
                    next_id: AtomicU64::new(0),
                    stopped: AtomicBool::new(false),
                }),
                task: RefCell::new(None),
            }),
        };

        let runner = cycler.clone();
        let task = lp.spawn_named("cycler", async move { runner.run().await });
        *cycler.core.task.borrow_mut() = Some(task);

        cycler
    }

    /// Registers `function`. Lower priorities run first.
    pub fn add(&self, priority: i32, function: CycleFn) -> CycleId {
        let id = self.core.remote.next_id();
        self.insert(id, priority, function);
        id
    }

    /// Unregisters a function. Returns whether it was registered.
    pub fn remove(&self, id: CycleId) -> bool {
        self.apply_commands();

        let mut entries = self.core.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Number of registered functions, including requests from other
    /// threads not applied yet.
    pub fn len(&self) -> usize {
        self.apply_commands();
        self.core.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn period(&self) -> Duration {
        self.core.period
    }

    /// Returns a handle registering functions from any thread.
    pub fn handle(&self) -> CyclerHandle {
        CyclerHandle {
            remote: self.core.remote.clone(),
        }
    }

    /// Stops cycling. A cycle in progress is cancelled at its next
    /// suspension point.
    pub fn stop(&self) {
        self.core.remote.stopped.store(true, Ordering::Release);
        if let Some(task) = self.core.task.borrow_mut().take() {
            task.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.core.remote.stopped.load(Ordering::Acquire)
    }

    fn insert(&self, id: CycleId, priority: i32, function: CycleFn) {
        let mut entries = self.core.entries.borrow_mut();
        let index = entries.partition_point(|entry| entry.priority <= priority);
        entries.insert(
            index,
            Entry {
                id,
                priority,
                function: Rc::new(function),
            },
        );
    }

    fn apply_commands(&self) {
        while let Some(command) = self.core.remote.commands.pop() {
            match command {
                Command::Add(id, priority, function) => self.insert(id, priority, function),
                Command::Remove(id) => {
                    self.core.entries.borrow_mut().retain(|entry| entry.id != id);
                }
            }
        }
    }

    async fn run(&self) -> Result<()> {
        loop {
            let nap = match self.core.lp.upgrade() {
                Some(lp) => sleep(&lp, self.core.period),
                None => return Ok(()),
            };
            nap.await?;

            self.cycle().await?;
        }
    }

    async fn cycle(&self) -> Result<()> {
        self.apply_commands();

        let due: Vec<(CycleId, Rc<CycleFn>)> = self
            .core
            .entries
            .borrow()
            .iter()
            .map(|entry| (entry.id, entry.function.clone()))
            .collect();
        trace!("cycle over {} function(s)", due.len());

        for (id, function) in due {
            if !self.is_registered(id) {
                continue;
            }

            let outcome = match &*function {
                CycleFn::Sync(function) => {
                    panic::catch_unwind(AssertUnwindSafe(|| function(self)))
                        .unwrap_or_else(|payload| Err(Error::Panic(panic_message(&*payload))))
                }
                CycleFn::Async(function) => {
                    let computation = panic::catch_unwind(AssertUnwindSafe(|| function(self)));
                    match computation {
                        Ok(computation) => computation.await,
                        Err(payload) => Err(Error::Panic(panic_message(&*payload))),
                    }
                }
            };

            match outcome {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => self.report(id, &err),
            }
        }

        Ok(())
    }

    fn is_registered(&self, id: CycleId) -> bool {
        self.apply_commands();
        self.core.entries.borrow().iter().any(|entry| entry.id == id)
    }

    fn report(&self, id: CycleId, err: &Error) {
        let message = format!("cycle function {:?} failed: {}", id, err);
        match self.core.lp.upgrade() {
            Some(lp) => lp.report(&message),
            None => debug!("{}", message),
        }
    }
}

impl fmt::Debug for Cycler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycler")
            .field("period", &self.core.period)
            .field("functions", &self.core.entries.borrow().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Thread-safe registration handle for a [`Cycler`].
#[derive(Clone)]
pub struct CyclerHandle {
    remote: Arc<Remote>,
}

impl CyclerHandle {
    /// Queues a registration, applied before the next cycle.
    pub fn add(&self, priority: i32, function: CycleFn) -> CycleId {
        let id = self.remote.next_id();
        self.remote.commands.push(Command::Add(id, priority, function));
        id
    }

    /// Queues an unregistration, applied before the next cycle.
    pub fn remove(&self, id: CycleId) {
        self.remote.commands.push(Command::Remove(id));
    }

    pub fn is_stopped(&self) -> bool {
        self.remote.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CyclerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclerHandle")
            .field("queued", &self.remote.commands.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(CyclerHandle: Send, Sync, Clone);
    assert_impl_all!(CycleFn: Send);

    #[test]
    fn test_entries_sorted_by_priority_then_registration() {
        let lp = EventThread::new().unwrap();
        let cycler = Cycler::new(&lp, Duration::from_secs(60));

        let late = cycler.add(5, CycleFn::from_sync(|_| Ok(())));
        let first = cycler.add(-1, CycleFn::from_sync(|_| Ok(())));
        let tie = cycler.add(5, CycleFn::from_sync(|_| Ok(())));

        let order: Vec<CycleId> = cycler.core.entries.borrow().iter().map(|entry| entry.id).collect();
        assert_eq!(order, vec![first, late, tie]);

        assert!(cycler.remove(late));
        assert!(!cycler.remove(late));
        cycler.stop();
    }

    #[test]
    fn test_handle_requests_apply_on_the_loop() {
        let lp = EventThread::new().unwrap();
        let cycler = Cycler::new(&lp, Duration::from_secs(60));
        let handle = cycler.handle();

        let id = std::thread::spawn(move || handle.add(0, CycleFn::from_sync(|_| Ok(()))))
            .join()
            .unwrap();
        assert_eq!(cycler.len(), 1);

        cycler.handle().remove(id);
        assert!(cycler.is_empty());
        cycler.stop();
    }
}
