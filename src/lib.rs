//! Single-threaded cooperative event loop with futures, tasks and blocking
//! offload.
//!
//! An [`EventThread`] owns a ready queue, a timer heap and an I/O readiness
//! multiplexer, and runs one callback at a time. Everything asynchronous is
//! expressed with loop-bound [`Future`]s; a [`Task`] drives an `async` block
//! by resuming it each time the future it awaits completes.
//!
//! # Architecture
//!
//! - **EventThread**: the loop. Ticks promote due timers, poll the reactor
//!   and drain a snapshot of the ready queue
//! - **Handle / TimerHandle**: cancellable deferred callbacks
//! - **Future**: single-assignment result cell whose callbacks always run
//!   from the ready queue
//! - **Task**: a future driven by a computation, cancellable while suspended
//! - **Waiters**: first / all / until-exception / continuous aggregation
//! - **Sync**: FIFO lock and semaphore, event flag, bounded gate
//! - **Executor**: blocking callables on a pool of OS worker threads
//! - **LoopHandle**: the thread-safe side: scheduling, stop, pause and
//!   `run_blocking`
//! - **Cycler**: periodic functions ordered by priority
//!
//! # Example
//!
//! ```ignore
//! use scarlet::{EventThread, time::sleep};
//! use std::time::Duration;
//!
//! let lp = EventThread::new()?;
//! let nap = sleep(&lp, Duration::from_millis(10));
//! let answer = lp.run_until_complete(async move {
//!     nap.await?;
//!     Ok(42)
//! })?;
//! assert_eq!(answer, 42);
//! ```

mod builder;
pub mod cycler;
mod error;
mod executor;
pub mod future;
mod reactor;
mod runtime;
pub mod sync;
mod task;
pub mod time;
mod timer;

pub use builder::EventThreadBuilder;
pub use cycler::{CycleFn, CycleId, Cycler, CyclerHandle};
pub use error::{Error, Result};
pub use executor::ClaimedExecutor;
pub use future::waiters::{ContinuousWait, WaitForAll, WaitForFirst, WaitSets, WaitUntilException, gather};
pub use future::{CallbackId, Future, FutureState, SetStatus};
pub use runtime::{EventThread, Handle, LoopHandle, PauseGuard, SpawnedLoop, TimerHandle, yield_now};
pub use sync::{BoundedGate, CountingLock, Event, Lock, LockGuard};
pub use task::{Task, TaskId};
pub use timer::{TimerGroup, TimerKey};
