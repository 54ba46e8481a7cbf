//! Blocking worker threads for the `scarlet` event loop.
//!
//! The event loop never blocks. Work that has to block (file system calls or
//! CPU heavy parsing) is handed to a pool of OS threads.
//! This crate owns those threads and nothing else: it does not know about
//! the loop, its futures or its tasks. Results travel back through whatever
//! the submitted [`Job`] does when it runs.
//!
//! # Architecture
//!
//! - **Job**: one unit of blocking work, run once or cancelled
//! - **WorkerThread**: an OS thread draining its own FIFO of jobs
//! - **Pool**: free / busy / claimed bookkeeping with an idle keep-alive cap
//! - **Builder**: fluent configuration of a [`Pool`]
//!
//! # Example
//!
//! ```no_run
//! use scarlet_executor::{Pool, block_on, spawn_blocking};
//!
//! let mut pool = Pool::builder().min_kept(1).build();
//! let id = pool.checkout().unwrap();
//! let worker = pool.worker(id).unwrap();
//!
//! let answer = block_on(spawn_blocking(worker, || 6 * 7)).unwrap().unwrap();
//! assert_eq!(answer, 42);
//! pool.checkin(id);
//! ```

mod blocking;
mod builder;
mod job;
mod pool;
mod worker;

pub use blocking::{block_on, spawn_blocking};
pub use builder::Builder;
pub use job::{FnJob, Job};
pub use pool::Pool;
pub use worker::{WorkerId, WorkerThread};

use std::any::Any;

/// Renders a panic payload caught by [`std::panic::catch_unwind`].
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
