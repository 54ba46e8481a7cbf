//! Racing futures against a deadline.
//!
//! A timeout is a timer scheduled next to the future. Whichever settles
//! first wins: the timer is cancelled when the future finishes, and the
//! future expires when the timer fires while it is still pending.
//!
//! ```ignore
//! use scarlet::time::{future_or_timeout, sleep};
//! use scarlet::Error;
//! use std::time::Duration;
//!
//! let reply = lp.create_future::<String>();
//! let bounded = future_or_timeout(reply, Duration::from_millis(100));
//!
//! lp.spawn(async move {
//!     match bounded.await {
//!         Ok(reply) => println!("got {}", reply),
//!         Err(Error::Timeout) => println!("no reply"),
//!         Err(other) => return Err(other),
//!     }
//!     Ok(())
//! });
//! ```

use crate::error::Result;
use crate::future::Future;
use crate::runtime::EventThread;

use std::future::Future as StdFuture;
use std::time::Duration;

/// Arms a deadline on `future` and returns it.
///
/// If `delay` elapses while the future is pending, a plain future fails
/// with `Error::Timeout`; a task is cancelled and finishes with
/// `Error::Timeout`. A future that is already done is returned untouched.
///
/// # Arguments
/// * `future` - The future to bound
/// * `delay` - How long the future may stay pending
pub fn future_or_timeout<T: 'static>(future: Future<T>, delay: Duration) -> Future<T> {
    if future.done() {
        return future;
    }

    let lp = match future.event_loop() {
        Some(lp) => lp,
        None => return future,
    };

    let target = future.downgrade();
    let timer = lp.schedule_after(delay, move || {
        if let Some(future) = target.upgrade() {
            if !future.done() {
                future.expire();
            }
        }
    });

    future.add_done_callback(move |_| timer.cancel());
    future
}

/// Runs `awaitable` with a deadline.
///
/// The awaitable goes through [`EventThread::ensure_future`] right away, so
/// a plain computation starts running as a task and the clock starts now,
/// not when the returned future is first polled.
///
/// # Returns
/// A computation resolving to the awaitable's result, or `Err(Error::Timeout)`.
pub fn wait_for<T, F>(lp: &EventThread, awaitable: F, delay: Duration) -> impl StdFuture<Output = Result<T>> + 'static
where
    T: Clone + 'static,
    F: StdFuture<Output = Result<T>> + 'static,
{
    let armed = lp
        .ensure_future(awaitable)
        .map(|future| future_or_timeout(future, delay));

    async move { armed?.await }
}
