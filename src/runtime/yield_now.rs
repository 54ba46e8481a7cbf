use std::future::Future as StdFuture;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug, Default)]
pub struct YieldNow {
    woken: bool,
}

impl StdFuture for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.woken {
            return Poll::Ready(());
        }

        // The wake queues the next step behind everything already ready.
        self.woken = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Suspends the running task for exactly one tick.
///
/// # Example
/// ```ignore
/// lp.spawn(async move {
///     for chunk in work {
///         process(chunk);
///         yield_now().await;
///     }
///     Ok(())
/// });
/// ```
pub fn yield_now() -> YieldNow {
    YieldNow::default()
}
