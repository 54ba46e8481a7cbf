//! Synchronization primitives for tasks on one loop.
//!
//! All of them are built from [`Future`](crate::Future)s and FIFO waiter
//! queues. None of them is thread-safe, and none needs to be: every waiter
//! runs on the loop that created the primitive.
//!
//! - [`Lock`] / [`CountingLock`]: FIFO mutex and counting semaphore, with
//!   RAII guards
//! - [`Event`]: a flag tasks can wait on
//! - [`BoundedGate`]: runs at most `n` members at once and stops them all on
//!   the first failure

mod event;
mod gate;
mod lock;

pub use event::Event;
pub use gate::BoundedGate;
pub use lock::{CountingLock, Lock, LockGuard};
