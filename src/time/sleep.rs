use crate::future::Future;
use crate::runtime::EventThread;

use std::time::Duration;

/// Returns a future that finishes once `delay` has elapsed.
///
/// A zero delay finishes the future on the next tick rather than right
/// away. Cancelling the future cancels its timer.
///
/// # Example
/// ```ignore
/// let nap = sleep(&lp, Duration::from_millis(50));
/// lp.run_until_complete(nap)?;
/// ```
pub fn sleep(lp: &EventThread, delay: Duration) -> Future<()> {
    let future = lp.create_future();
    let target = future.downgrade();
    let wake = move || {
        if let Some(future) = target.upgrade() {
            future.set_result_if_pending(());
        }
    };

    if delay.is_zero() {
        if let Some(handle) = lp.schedule_now(wake) {
            future.add_done_callback(move |done| {
                if done.cancelled() {
                    handle.cancel();
                }
            });
        }
    } else {
        let timer = lp.schedule_after(delay, wake);
        future.add_done_callback(move |done| {
            if done.cancelled() {
                timer.cancel();
            }
        });
    }

    future
}
